//! The raw CIL instruction stream: the full ECMA-335 opcode table and a
//! byte-addressed reader with non-destructive lookahead.
//!
//! This is deliberately a thin helper. It knows how to map encodings to
//! opcodes and how to pull operand scalars out of the stream; all semantic
//! decisions live in the interpreter.

use crate::error::InvalidIl;
use std::fmt;

macro_rules! il_opcodes {
    (
        single { $($sname:ident = $sval:literal => $smn:literal,)* }
        extended { $($ename:ident = $eval:literal => $emn:literal,)* }
    ) => {
        /// A decoded CIL opcode. Covers the complete standard instruction
        /// set so that unsupported instructions can still be identified by
        /// name in diagnostics.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum IlOpcode {
            $($sname,)*
            $($ename,)*
        }

        impl IlOpcode {
            fn from_single(byte: u8) -> Option<Self> {
                match byte {
                    $($sval => Some(Self::$sname),)*
                    _ => None,
                }
            }

            fn from_extended(byte: u8) -> Option<Self> {
                match byte {
                    $($eval => Some(Self::$ename),)*
                    _ => None,
                }
            }

            /// The assembler mnemonic, as used in diagnostics.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Self::$sname => $smn,)*
                    $(Self::$ename => $emn,)*
                }
            }
        }
    };
}

il_opcodes! {
    single {
        Nop = 0x00 => "nop",
        Break = 0x01 => "break",
        Ldarg0 = 0x02 => "ldarg.0",
        Ldarg1 = 0x03 => "ldarg.1",
        Ldarg2 = 0x04 => "ldarg.2",
        Ldarg3 = 0x05 => "ldarg.3",
        Ldloc0 = 0x06 => "ldloc.0",
        Ldloc1 = 0x07 => "ldloc.1",
        Ldloc2 = 0x08 => "ldloc.2",
        Ldloc3 = 0x09 => "ldloc.3",
        Stloc0 = 0x0A => "stloc.0",
        Stloc1 = 0x0B => "stloc.1",
        Stloc2 = 0x0C => "stloc.2",
        Stloc3 = 0x0D => "stloc.3",
        LdargS = 0x0E => "ldarg.s",
        LdargaS = 0x0F => "ldarga.s",
        StargS = 0x10 => "starg.s",
        LdlocS = 0x11 => "ldloc.s",
        LdlocaS = 0x12 => "ldloca.s",
        StlocS = 0x13 => "stloc.s",
        Ldnull = 0x14 => "ldnull",
        LdcI4M1 = 0x15 => "ldc.i4.m1",
        LdcI40 = 0x16 => "ldc.i4.0",
        LdcI41 = 0x17 => "ldc.i4.1",
        LdcI42 = 0x18 => "ldc.i4.2",
        LdcI43 = 0x19 => "ldc.i4.3",
        LdcI44 = 0x1A => "ldc.i4.4",
        LdcI45 = 0x1B => "ldc.i4.5",
        LdcI46 = 0x1C => "ldc.i4.6",
        LdcI47 = 0x1D => "ldc.i4.7",
        LdcI48 = 0x1E => "ldc.i4.8",
        LdcI4S = 0x1F => "ldc.i4.s",
        LdcI4 = 0x20 => "ldc.i4",
        LdcI8 = 0x21 => "ldc.i8",
        LdcR4 = 0x22 => "ldc.r4",
        LdcR8 = 0x23 => "ldc.r8",
        Dup = 0x25 => "dup",
        Pop = 0x26 => "pop",
        Jmp = 0x27 => "jmp",
        Call = 0x28 => "call",
        Calli = 0x29 => "calli",
        Ret = 0x2A => "ret",
        BrS = 0x2B => "br.s",
        BrfalseS = 0x2C => "brfalse.s",
        BrtrueS = 0x2D => "brtrue.s",
        BeqS = 0x2E => "beq.s",
        BgeS = 0x2F => "bge.s",
        BgtS = 0x30 => "bgt.s",
        BleS = 0x31 => "ble.s",
        BltS = 0x32 => "blt.s",
        BneUnS = 0x33 => "bne.un.s",
        BgeUnS = 0x34 => "bge.un.s",
        BgtUnS = 0x35 => "bgt.un.s",
        BleUnS = 0x36 => "ble.un.s",
        BltUnS = 0x37 => "blt.un.s",
        Br = 0x38 => "br",
        Brfalse = 0x39 => "brfalse",
        Brtrue = 0x3A => "brtrue",
        Beq = 0x3B => "beq",
        Bge = 0x3C => "bge",
        Bgt = 0x3D => "bgt",
        Ble = 0x3E => "ble",
        Blt = 0x3F => "blt",
        BneUn = 0x40 => "bne.un",
        BgeUn = 0x41 => "bge.un",
        BgtUn = 0x42 => "bgt.un",
        BleUn = 0x43 => "ble.un",
        BltUn = 0x44 => "blt.un",
        Switch = 0x45 => "switch",
        LdindI1 = 0x46 => "ldind.i1",
        LdindU1 = 0x47 => "ldind.u1",
        LdindI2 = 0x48 => "ldind.i2",
        LdindU2 = 0x49 => "ldind.u2",
        LdindI4 = 0x4A => "ldind.i4",
        LdindU4 = 0x4B => "ldind.u4",
        LdindI8 = 0x4C => "ldind.i8",
        LdindI = 0x4D => "ldind.i",
        LdindR4 = 0x4E => "ldind.r4",
        LdindR8 = 0x4F => "ldind.r8",
        LdindRef = 0x50 => "ldind.ref",
        StindRef = 0x51 => "stind.ref",
        StindI1 = 0x52 => "stind.i1",
        StindI2 = 0x53 => "stind.i2",
        StindI4 = 0x54 => "stind.i4",
        StindI8 = 0x55 => "stind.i8",
        StindR4 = 0x56 => "stind.r4",
        StindR8 = 0x57 => "stind.r8",
        Add = 0x58 => "add",
        Sub = 0x59 => "sub",
        Mul = 0x5A => "mul",
        Div = 0x5B => "div",
        DivUn = 0x5C => "div.un",
        Rem = 0x5D => "rem",
        RemUn = 0x5E => "rem.un",
        And = 0x5F => "and",
        Or = 0x60 => "or",
        Xor = 0x61 => "xor",
        Shl = 0x62 => "shl",
        Shr = 0x63 => "shr",
        ShrUn = 0x64 => "shr.un",
        Neg = 0x65 => "neg",
        Not = 0x66 => "not",
        ConvI1 = 0x67 => "conv.i1",
        ConvI2 = 0x68 => "conv.i2",
        ConvI4 = 0x69 => "conv.i4",
        ConvI8 = 0x6A => "conv.i8",
        ConvR4 = 0x6B => "conv.r4",
        ConvR8 = 0x6C => "conv.r8",
        ConvU4 = 0x6D => "conv.u4",
        ConvU8 = 0x6E => "conv.u8",
        Callvirt = 0x6F => "callvirt",
        Cpobj = 0x70 => "cpobj",
        Ldobj = 0x71 => "ldobj",
        Ldstr = 0x72 => "ldstr",
        Newobj = 0x73 => "newobj",
        Castclass = 0x74 => "castclass",
        Isinst = 0x75 => "isinst",
        ConvRUn = 0x76 => "conv.r.un",
        Unbox = 0x79 => "unbox",
        Throw = 0x7A => "throw",
        Ldfld = 0x7B => "ldfld",
        Ldflda = 0x7C => "ldflda",
        Stfld = 0x7D => "stfld",
        Ldsfld = 0x7E => "ldsfld",
        Ldsflda = 0x7F => "ldsflda",
        Stsfld = 0x80 => "stsfld",
        Stobj = 0x81 => "stobj",
        ConvOvfI1Un = 0x82 => "conv.ovf.i1.un",
        ConvOvfI2Un = 0x83 => "conv.ovf.i2.un",
        ConvOvfI4Un = 0x84 => "conv.ovf.i4.un",
        ConvOvfI8Un = 0x85 => "conv.ovf.i8.un",
        ConvOvfU1Un = 0x86 => "conv.ovf.u1.un",
        ConvOvfU2Un = 0x87 => "conv.ovf.u2.un",
        ConvOvfU4Un = 0x88 => "conv.ovf.u4.un",
        ConvOvfU8Un = 0x89 => "conv.ovf.u8.un",
        ConvOvfIUn = 0x8A => "conv.ovf.i.un",
        ConvOvfUUn = 0x8B => "conv.ovf.u.un",
        Box = 0x8C => "box",
        Newarr = 0x8D => "newarr",
        Ldlen = 0x8E => "ldlen",
        Ldelema = 0x8F => "ldelema",
        LdelemI1 = 0x90 => "ldelem.i1",
        LdelemU1 = 0x91 => "ldelem.u1",
        LdelemI2 = 0x92 => "ldelem.i2",
        LdelemU2 = 0x93 => "ldelem.u2",
        LdelemI4 = 0x94 => "ldelem.i4",
        LdelemU4 = 0x95 => "ldelem.u4",
        LdelemI8 = 0x96 => "ldelem.i8",
        LdelemI = 0x97 => "ldelem.i",
        LdelemR4 = 0x98 => "ldelem.r4",
        LdelemR8 = 0x99 => "ldelem.r8",
        LdelemRef = 0x9A => "ldelem.ref",
        StelemI = 0x9B => "stelem.i",
        StelemI1 = 0x9C => "stelem.i1",
        StelemI2 = 0x9D => "stelem.i2",
        StelemI4 = 0x9E => "stelem.i4",
        StelemI8 = 0x9F => "stelem.i8",
        StelemR4 = 0xA0 => "stelem.r4",
        StelemR8 = 0xA1 => "stelem.r8",
        StelemRef = 0xA2 => "stelem.ref",
        Ldelem = 0xA3 => "ldelem",
        Stelem = 0xA4 => "stelem",
        UnboxAny = 0xA5 => "unbox.any",
        ConvOvfI1 = 0xB3 => "conv.ovf.i1",
        ConvOvfU1 = 0xB4 => "conv.ovf.u1",
        ConvOvfI2 = 0xB5 => "conv.ovf.i2",
        ConvOvfU2 = 0xB6 => "conv.ovf.u2",
        ConvOvfI4 = 0xB7 => "conv.ovf.i4",
        ConvOvfU4 = 0xB8 => "conv.ovf.u4",
        ConvOvfI8 = 0xB9 => "conv.ovf.i8",
        ConvOvfU8 = 0xBA => "conv.ovf.u8",
        Refanyval = 0xC2 => "refanyval",
        Ckfinite = 0xC3 => "ckfinite",
        Mkrefany = 0xC6 => "mkrefany",
        Ldtoken = 0xD0 => "ldtoken",
        ConvU2 = 0xD1 => "conv.u2",
        ConvU1 = 0xD2 => "conv.u1",
        ConvI = 0xD3 => "conv.i",
        ConvOvfI = 0xD4 => "conv.ovf.i",
        ConvOvfU = 0xD5 => "conv.ovf.u",
        AddOvf = 0xD6 => "add.ovf",
        AddOvfUn = 0xD7 => "add.ovf.un",
        MulOvf = 0xD8 => "mul.ovf",
        MulOvfUn = 0xD9 => "mul.ovf.un",
        SubOvf = 0xDA => "sub.ovf",
        SubOvfUn = 0xDB => "sub.ovf.un",
        Endfinally = 0xDC => "endfinally",
        Leave = 0xDD => "leave",
        LeaveS = 0xDE => "leave.s",
        StindI = 0xDF => "stind.i",
        ConvU = 0xE0 => "conv.u",
    }
    extended {
        Arglist = 0x00 => "arglist",
        Ceq = 0x01 => "ceq",
        Cgt = 0x02 => "cgt",
        CgtUn = 0x03 => "cgt.un",
        Clt = 0x04 => "clt",
        CltUn = 0x05 => "clt.un",
        Ldftn = 0x06 => "ldftn",
        Ldvirtftn = 0x07 => "ldvirtftn",
        Ldarg = 0x09 => "ldarg",
        Ldarga = 0x0A => "ldarga",
        Starg = 0x0B => "starg",
        Ldloc = 0x0C => "ldloc",
        Ldloca = 0x0D => "ldloca",
        Stloc = 0x0E => "stloc",
        Localloc = 0x0F => "localloc",
        Endfilter = 0x11 => "endfilter",
        Unaligned = 0x12 => "unaligned.",
        Volatile = 0x13 => "volatile.",
        Tail = 0x14 => "tail.",
        Initobj = 0x15 => "initobj",
        Constrained = 0x16 => "constrained.",
        Cpblk = 0x17 => "cpblk",
        Initblk = 0x18 => "initblk",
        Rethrow = 0x1A => "rethrow",
        Sizeof = 0x1C => "sizeof",
        Refanytype = 0x1D => "refanytype",
        Readonly = 0x1E => "readonly.",
    }
}

impl fmt::Display for IlOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Two-byte opcodes live behind this prefix byte.
const EXTENDED_PREFIX: u8 = 0xFE;

/// Forward-only reader over an IL byte stream.
///
/// Opcode decoding is split into a non-consuming `peek_opcode` and the
/// consuming `read_opcode` so stream utilities can look ahead by one
/// instruction without committing to it.
pub struct IlReader<'a> {
    il: &'a [u8],
    offset: usize,
}

impl<'a> IlReader<'a> {
    pub fn new(il: &'a [u8]) -> Self {
        Self { il, offset: 0 }
    }

    pub fn has_next(&self) -> bool {
        self.offset < self.il.len()
    }

    /// Current byte offset into the stream.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.il.len()
    }

    /// Decodes the opcode at the current offset without consuming it.
    /// Returns the opcode and its encoded length in bytes.
    pub fn peek_opcode(&self) -> Result<(IlOpcode, usize), InvalidIl> {
        let first = *self.il.get(self.offset).ok_or(InvalidIl::TruncatedStream)?;
        if first == EXTENDED_PREFIX {
            let second = *self
                .il
                .get(self.offset + 1)
                .ok_or(InvalidIl::TruncatedStream)?;
            let opcode = IlOpcode::from_extended(second)
                .ok_or(InvalidIl::UnknownOpcode(0xFE00 | second as u16))?;
            Ok((opcode, 2))
        } else {
            let opcode =
                IlOpcode::from_single(first).ok_or(InvalidIl::UnknownOpcode(first as u16))?;
            Ok((opcode, 1))
        }
    }

    /// Decodes and consumes the opcode at the current offset.
    pub fn read_opcode(&mut self) -> Result<IlOpcode, InvalidIl> {
        let (opcode, len) = self.peek_opcode()?;
        self.offset += len;
        Ok(opcode)
    }

    pub fn read_u8(&mut self) -> Result<u8, InvalidIl> {
        let b = *self.il.get(self.offset).ok_or(InvalidIl::TruncatedStream)?;
        self.offset += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16, InvalidIl> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, InvalidIl> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, InvalidIl> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, InvalidIl> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, InvalidIl> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Token operands index the method body's token table.
    pub fn read_token(&mut self) -> Result<u32, InvalidIl> {
        self.read_u32()
    }

    /// Repositions the reader. Offsets up to and including the stream end
    /// are valid (a branch may land exactly past the last instruction).
    pub fn seek(&mut self, offset: usize) -> Result<(), InvalidIl> {
        if offset > self.il.len() {
            return Err(InvalidIl::BranchOutOfRange);
        }
        self.offset = offset;
        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], InvalidIl> {
        let end = self.offset.checked_add(N).ok_or(InvalidIl::TruncatedStream)?;
        let bytes = self
            .il
            .get(self.offset..end)
            .ok_or(InvalidIl::TruncatedStream)?;
        self.offset = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }
}
