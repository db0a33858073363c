//! CIL opcode values (ECMA-335, III). Two-byte opcodes carry the 0xFE prefix in
//! their high byte.

pub type Opcode = u16;

macro_rules! opcodes {
    ($($name:ident = $val:literal,)+) => {
        $(pub const $name: Opcode = $val;)*
    };
}

opcodes! {
    NOP = 0x00,
    BREAK = 0x01,
    LDARG_0 = 0x02,
    LDARG_1 = 0x03,
    LDARG_2 = 0x04,
    LDARG_3 = 0x05,
    LDLOC_0 = 0x06,
    LDLOC_1 = 0x07,
    LDLOC_2 = 0x08,
    LDLOC_3 = 0x09,
    STLOC_0 = 0x0A,
    STLOC_1 = 0x0B,
    STLOC_2 = 0x0C,
    STLOC_3 = 0x0D,
    LDARG_S = 0x0E,
    LDARGA_S = 0x0F,
    STARG_S = 0x10,
    LDLOC_S = 0x11,
    LDLOCA_S = 0x12,
    STLOC_S = 0x13,
    LDNULL = 0x14,
    LDC_I4_M1 = 0x15,
    LDC_I4_0 = 0x16,
    LDC_I4_S = 0x1F,
    LDC_I4 = 0x20,
    LDC_I8 = 0x21,
    LDC_R4 = 0x22,
    LDC_R8 = 0x23,
    DUP = 0x25,
    POP = 0x26,
    JMP = 0x27,
    CALL = 0x28,
    CALLI = 0x29,
    RET = 0x2A,
    BR_S = 0x2B,
    BRFALSE_S = 0x2C,
    BRTRUE_S = 0x2D,
    BEQ_S = 0x2E,
    BGE_S = 0x2F,
    BGT_S = 0x30,
    BLE_S = 0x31,
    BLT_S = 0x32,
    BNE_UN_S = 0x33,
    BGE_UN_S = 0x34,
    BGT_UN_S = 0x35,
    BLE_UN_S = 0x36,
    BLT_UN_S = 0x37,
    BR = 0x38,
    BRFALSE = 0x39,
    BRTRUE = 0x3A,
    BEQ = 0x3B,
    BGE = 0x3C,
    BGT = 0x3D,
    BLE = 0x3E,
    BLT = 0x3F,
    BNE_UN = 0x40,
    BGE_UN = 0x41,
    BGT_UN = 0x42,
    BLE_UN = 0x43,
    BLT_UN = 0x44,
    SWITCH = 0x45,
    LDIND_I1 = 0x46,
    LDIND_U1 = 0x47,
    LDIND_I2 = 0x48,
    LDIND_U2 = 0x49,
    LDIND_I4 = 0x4A,
    LDIND_U4 = 0x4B,
    LDIND_I8 = 0x4C,
    LDIND_I = 0x4D,
    LDIND_R4 = 0x4E,
    LDIND_R8 = 0x4F,
    LDIND_REF = 0x50,
    STIND_REF = 0x51,
    STIND_I1 = 0x52,
    STIND_I2 = 0x53,
    STIND_I4 = 0x54,
    STIND_I8 = 0x55,
    STIND_R4 = 0x56,
    STIND_R8 = 0x57,
    ADD = 0x58,
    SUB = 0x59,
    MUL = 0x5A,
    DIV = 0x5B,
    DIV_UN = 0x5C,
    REM = 0x5D,
    REM_UN = 0x5E,
    AND = 0x5F,
    OR = 0x60,
    XOR = 0x61,
    SHL = 0x62,
    SHR = 0x63,
    SHR_UN = 0x64,
    NEG = 0x65,
    NOT = 0x66,
    CONV_I1 = 0x67,
    CONV_I2 = 0x68,
    CONV_I4 = 0x69,
    CONV_I8 = 0x6A,
    CONV_R4 = 0x6B,
    CONV_R8 = 0x6C,
    CONV_U4 = 0x6D,
    CONV_U8 = 0x6E,
    CALLVIRT = 0x6F,
    LDOBJ = 0x71,
    LDSTR = 0x72,
    NEWOBJ = 0x73,
    CASTCLASS = 0x74,
    ISINST = 0x75,
    CONV_R_UN = 0x76,
    UNBOX = 0x79,
    THROW = 0x7A,
    LDFLD = 0x7B,
    LDFLDA = 0x7C,
    STFLD = 0x7D,
    LDSFLD = 0x7E,
    LDSFLDA = 0x7F,
    STSFLD = 0x80,
    STOBJ = 0x81,
    CONV_OVF_I1_UN = 0x82,
    CONV_OVF_I2_UN = 0x83,
    CONV_OVF_I4_UN = 0x84,
    CONV_OVF_I8_UN = 0x85,
    CONV_OVF_U1_UN = 0x86,
    CONV_OVF_U2_UN = 0x87,
    CONV_OVF_U4_UN = 0x88,
    CONV_OVF_U8_UN = 0x89,
    CONV_OVF_I_UN = 0x8A,
    CONV_OVF_U_UN = 0x8B,
    BOX = 0x8C,
    NEWARR = 0x8D,
    LDLEN = 0x8E,
    LDELEMA = 0x8F,
    LDELEM_I1 = 0x90,
    LDELEM_U1 = 0x91,
    LDELEM_I2 = 0x92,
    LDELEM_U2 = 0x93,
    LDELEM_I4 = 0x94,
    LDELEM_U4 = 0x95,
    LDELEM_I8 = 0x96,
    LDELEM_I = 0x97,
    LDELEM_R4 = 0x98,
    LDELEM_R8 = 0x99,
    LDELEM_REF = 0x9A,
    STELEM_I = 0x9B,
    STELEM_I1 = 0x9C,
    STELEM_I2 = 0x9D,
    STELEM_I4 = 0x9E,
    STELEM_I8 = 0x9F,
    STELEM_R4 = 0xA0,
    STELEM_R8 = 0xA1,
    STELEM_REF = 0xA2,
    LDELEM = 0xA3,
    STELEM = 0xA4,
    UNBOX_ANY = 0xA5,
    CONV_OVF_I1 = 0xB3,
    CONV_OVF_U1 = 0xB4,
    CONV_OVF_I2 = 0xB5,
    CONV_OVF_U2 = 0xB6,
    CONV_OVF_I4 = 0xB7,
    CONV_OVF_U4 = 0xB8,
    CONV_OVF_I8 = 0xB9,
    CONV_OVF_U8 = 0xBA,
    LDTOKEN = 0xD0,
    CONV_U2 = 0xD1,
    CONV_U1 = 0xD2,
    CONV_I = 0xD3,
    CONV_OVF_I = 0xD4,
    CONV_OVF_U = 0xD5,
    ADD_OVF = 0xD6,
    ADD_OVF_UN = 0xD7,
    MUL_OVF = 0xD8,
    MUL_OVF_UN = 0xD9,
    SUB_OVF = 0xDA,
    SUB_OVF_UN = 0xDB,
    ENDFINALLY = 0xDC,
    LEAVE = 0xDD,
    LEAVE_S = 0xDE,
    STIND_I = 0xDF,
    CONV_U = 0xE0,
    CEQ = 0xFE01,
    CGT = 0xFE02,
    CGT_UN = 0xFE03,
    CLT = 0xFE04,
    CLT_UN = 0xFE05,
    LDFTN = 0xFE06,
    LDVIRTFTN = 0xFE07,
    LDARG = 0xFE09,
    LDARGA = 0xFE0A,
    STARG = 0xFE0B,
    LDLOC = 0xFE0C,
    LDLOCA = 0xFE0D,
    STLOC = 0xFE0E,
    LOCALLOC = 0xFE0F,
    ENDFILTER = 0xFE11,
    VOLATILE = 0xFE13,
    TAIL = 0xFE14,
    INITOBJ = 0xFE15,
    CONSTRAINED = 0xFE16,
    RETHROW = 0xFE1A,
    SIZEOF = 0xFE1C,
}

/// Appends the one- or two-byte encoding of `op`.
pub fn write_opcode(buf: &mut Vec<u8>, op: Opcode) {
    if op > 0xFF {
        buf.push(0xFE);
    }
    buf.push(op as u8);
}

/// The short form of a long branch opcode.
pub fn short_branch(op: Opcode) -> Option<Opcode> {
    match op {
        BR..=BLT_UN => Some(op - (BR - BR_S)),
        LEAVE => Some(LEAVE_S),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_forms() {
        assert_eq!(short_branch(BR), Some(BR_S));
        assert_eq!(short_branch(BLT_UN), Some(BLT_UN_S));
        assert_eq!(short_branch(BRTRUE), Some(BRTRUE_S));
        assert_eq!(short_branch(LEAVE), Some(LEAVE_S));
        assert_eq!(short_branch(RET), None);
    }

    #[test]
    fn prefixed() {
        let mut buf = vec![];
        write_opcode(&mut buf, CEQ);
        write_opcode(&mut buf, RET);
        assert_eq!(buf, [0xFE, 0x01, 0x2A]);
    }
}
