//! The declarative encoding table the decoder matches against.
//!
//! Each [`EncodingRow`] lists the bit fields of one instruction form in stream
//! order, most significant bit first. Literal fields must match the stream;
//! capture fields store the bits (or a forced value) under their tag. Rows are
//! checked for pairwise ambiguity when the table is built, so the order in
//! which they are tried never changes the decoded result.

use crate::error::TableError;
use crate::instruction::Opcode;

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum FieldTag {
    Literal,
    D,
    W,
    S,
    Mod,
    Reg,
    Rm,
    Data,
    IsJump,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct BitFieldSpec {
    pub tag: FieldTag,
    pub bits: u8,
    /// Literal value to match, or the forced value when `forced` is set.
    pub value: u8,
    pub forced: bool,
}

impl BitFieldSpec {
    pub const fn capture(tag: FieldTag, bits: u8) -> Self {
        Self {
            tag,
            bits,
            value: 0,
            forced: false,
        }
    }

    /// A field that consumes no bits and always carries `value`.
    pub const fn implicit(tag: FieldTag, value: u8) -> Self {
        Self {
            tag,
            bits: 0,
            value,
            forced: true,
        }
    }

    /// Marker fields declare that the row carries something (data, jump) without
    /// reading bits for it at this point.
    pub const fn marker(tag: FieldTag) -> Self {
        Self::capture(tag, 0)
    }
}

/// A literal of `bits` bits that must equal `value`.
pub const fn lit(bits: u8, value: u8) -> BitFieldSpec {
    BitFieldSpec {
        tag: FieldTag::Literal,
        bits,
        value,
        forced: false,
    }
}

pub const D: BitFieldSpec = BitFieldSpec::capture(FieldTag::D, 1);
pub const W: BitFieldSpec = BitFieldSpec::capture(FieldTag::W, 1);
pub const S: BitFieldSpec = BitFieldSpec::capture(FieldTag::S, 1);
pub const MOD: BitFieldSpec = BitFieldSpec::capture(FieldTag::Mod, 2);
pub const REG: BitFieldSpec = BitFieldSpec::capture(FieldTag::Reg, 3);
pub const RM: BitFieldSpec = BitFieldSpec::capture(FieldTag::Rm, 3);
pub const DATA: BitFieldSpec = BitFieldSpec::marker(FieldTag::Data);
pub const IS_JUMP: BitFieldSpec = BitFieldSpec::marker(FieldTag::IsJump);

pub const fn imp_d(value: u8) -> BitFieldSpec {
    BitFieldSpec::implicit(FieldTag::D, value)
}

pub const fn imp_w(value: u8) -> BitFieldSpec {
    BitFieldSpec::implicit(FieldTag::W, value)
}

pub const fn imp_mod(value: u8) -> BitFieldSpec {
    BitFieldSpec::implicit(FieldTag::Mod, value)
}

pub const fn imp_reg(value: u8) -> BitFieldSpec {
    BitFieldSpec::implicit(FieldTag::Reg, value)
}

pub const fn imp_rm(value: u8) -> BitFieldSpec {
    BitFieldSpec::implicit(FieldTag::Rm, value)
}

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct EncodingRow {
    pub opcode: Opcode,
    pub fields: Vec<BitFieldSpec>,
}

impl EncodingRow {
    pub fn new(opcode: Opcode, fields: &[BitFieldSpec]) -> Self {
        Self {
            opcode,
            fields: fields.to_vec(),
        }
    }

    /// Whether the row declares a capture field with this tag.
    pub fn declares(&self, tag: FieldTag) -> bool {
        self.fields.iter().any(|field| field.tag == tag)
    }
}

const JUMPS: [(Opcode, u8); 20] = [
    (Opcode::Jo, 0x70),
    (Opcode::Jno, 0x71),
    (Opcode::Jb, 0x72),
    (Opcode::Jnb, 0x73),
    (Opcode::Je, 0x74),
    (Opcode::Jne, 0x75),
    (Opcode::Jbe, 0x76),
    (Opcode::Ja, 0x77),
    (Opcode::Js, 0x78),
    (Opcode::Jns, 0x79),
    (Opcode::Jp, 0x7a),
    (Opcode::Jnp, 0x7b),
    (Opcode::Jl, 0x7c),
    (Opcode::Jnl, 0x7d),
    (Opcode::Jle, 0x7e),
    (Opcode::Jg, 0x7f),
    (Opcode::Loopnz, 0xe0),
    (Opcode::Loopz, 0xe1),
    (Opcode::Loop, 0xe2),
    (Opcode::Jcxz, 0xe3),
];

/// Every supported instruction form.
pub fn standard_rows() -> Vec<EncodingRow> {
    use Opcode::*;

    let mut rows = vec![
        // Register/memory to/from register
        EncodingRow::new(Mov, &[lit(6, 0b100010), D, W, MOD, REG, RM]),
        // Immediate to register/memory
        EncodingRow::new(Mov, &[lit(7, 0b1100011), W, MOD, lit(3, 0b000), RM, DATA]),
        // Immediate to register; the register is always the destination
        EncodingRow::new(Mov, &[lit(4, 0b1011), W, REG, DATA, imp_d(1)]),
        // Memory to accumulator
        EncodingRow::new(
            Mov,
            &[lit(7, 0b1010000), W, imp_mod(0b00), imp_rm(0b110), imp_reg(0), imp_d(1)],
        ),
        // Accumulator to memory
        EncodingRow::new(
            Mov,
            &[lit(7, 0b1010001), W, imp_mod(0b00), imp_rm(0b110), imp_reg(0), imp_d(0)],
        ),
        EncodingRow::new(Add, &[lit(6, 0b000000), D, W, MOD, REG, RM]),
        EncodingRow::new(Add, &[lit(6, 0b100000), S, W, MOD, lit(3, 0b000), RM, DATA]),
        EncodingRow::new(Add, &[lit(7, 0b0000010), W, DATA, imp_reg(0), imp_d(1)]),
        EncodingRow::new(Sub, &[lit(6, 0b001010), D, W, MOD, REG, RM]),
        EncodingRow::new(Sub, &[lit(6, 0b100000), S, W, MOD, lit(3, 0b101), RM, DATA]),
        EncodingRow::new(Sub, &[lit(7, 0b0010110), W, DATA, imp_reg(0), imp_d(1)]),
        EncodingRow::new(Cmp, &[lit(6, 0b001110), D, W, MOD, REG, RM]),
        EncodingRow::new(Cmp, &[lit(6, 0b100000), S, W, MOD, lit(3, 0b111), RM, DATA]),
        EncodingRow::new(Cmp, &[lit(7, 0b0011110), W, DATA, imp_reg(0), imp_d(1)]),
        // Short and near direct jumps, near direct call
        EncodingRow::new(Jmp, &[lit(8, 0b11101011), DATA, IS_JUMP]),
        EncodingRow::new(Jmp, &[lit(8, 0b11101001), DATA, imp_w(1), IS_JUMP]),
        EncodingRow::new(Call, &[lit(8, 0b11101000), DATA, imp_w(1), IS_JUMP]),
        // Return within segment
        EncodingRow::new(Ret, &[lit(8, 0b11000011)]),
        EncodingRow::new(Push, &[lit(8, 0b11111111), MOD, lit(3, 0b110), RM, imp_w(1)]),
        EncodingRow::new(Push, &[lit(5, 0b01010), REG, imp_w(1), imp_d(1)]),
        EncodingRow::new(Pop, &[lit(8, 0b10001111), MOD, lit(3, 0b000), RM, imp_w(1)]),
        EncodingRow::new(Pop, &[lit(5, 0b01011), REG, imp_w(1), imp_d(1)]),
    ];
    rows.extend(
        JUMPS
            .iter()
            .map(|&(opcode, encoding)| EncodingRow::new(opcode, &[lit(8, encoding), DATA, IS_JUMP])),
    );
    rows
}

/// Literal bits of a row laid out by byte position: `(mask, value)` per byte.
fn literal_pattern(index: usize, row: &EncodingRow) -> Result<Vec<(u8, u8)>, TableError> {
    if row.fields.iter().all(|field| field.bits == 0) {
        return Err(TableError::EmptyRow {
            row: index,
            opcode: row.opcode,
        });
    }

    let mut pattern = Vec::new();
    let mut bit = 0usize;
    for field in &row.fields {
        if field.bits == 0 {
            continue;
        }
        let offset = bit % 8;
        if offset + field.bits as usize > 8 {
            return Err(TableError::MisalignedField {
                row: index,
                opcode: row.opcode,
                bit,
            });
        }
        if offset == 0 {
            pattern.push((0u8, 0u8));
        }
        if field.tag == FieldTag::Literal {
            let shift = 8 - offset - field.bits as usize;
            let ones = ((1u16 << field.bits) - 1) as u8;
            if let Some((mask, value)) = pattern.last_mut() {
                *mask |= ones << shift;
                *value |= (field.value & ones) << shift;
            }
        }
        bit += field.bits as usize;
    }

    if bit % 8 != 0 {
        return Err(TableError::MisalignedField {
            row: index,
            opcode: row.opcode,
            bit,
        });
    }
    Ok(pattern)
}

/// Two rows are ambiguous when some byte sequence satisfies the literal bits of both.
fn overlaps(a: &[(u8, u8)], b: &[(u8, u8)]) -> bool {
    a.iter()
        .zip(b)
        .all(|((mask_a, value_a), (mask_b, value_b))| (value_a ^ value_b) & mask_a & mask_b == 0)
}

#[derive(Debug, Clone)]
pub struct EncodingTable {
    rows: Vec<EncodingRow>,
}

impl EncodingTable {
    /// Builds a table, rejecting rows that straddle byte boundaries or that
    /// could match the same bytes as another row.
    pub fn new<I>(rows: I) -> Result<Self, TableError>
    where
        I: IntoIterator<Item = EncodingRow>,
    {
        let rows: Vec<EncodingRow> = rows.into_iter().collect();
        let patterns = rows
            .iter()
            .enumerate()
            .map(|(index, row)| literal_pattern(index, row))
            .collect::<Result<Vec<_>, _>>()?;

        for (first, pattern_a) in patterns.iter().enumerate() {
            for (second, pattern_b) in patterns.iter().enumerate().skip(first + 1) {
                if overlaps(pattern_a, pattern_b) {
                    return Err(TableError::Ambiguous {
                        first,
                        first_opcode: rows[first].opcode,
                        second,
                        second_opcode: rows[second].opcode,
                    });
                }
            }
        }

        tracing::debug!(rows = rows.len(), "encoding table validated");
        Ok(Self { rows })
    }

    pub fn standard() -> Result<Self, TableError> {
        Self::new(standard_rows())
    }

    pub fn rows(&self) -> &[EncodingRow] {
        &self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table_is_unambiguous() {
        let table = EncodingTable::standard().unwrap();
        assert_eq!(table.rows().len(), 42);
    }

    #[test]
    fn test_literal_pattern_spans_second_byte() {
        let add = EncodingRow::new(Opcode::Add, &[lit(6, 0b100000), S, W, MOD, lit(3, 0b000), RM, DATA]);
        let pattern = literal_pattern(0, &add).unwrap();
        assert_eq!(pattern, vec![(0b1111_1100, 0b1000_0000), (0b0011_1000, 0)]);
    }

    #[test]
    fn test_overlapping_rows_are_rejected() {
        let rows = [
            EncodingRow::new(Opcode::Mov, &[lit(4, 0b1011), W, REG, DATA]),
            EncodingRow::new(Opcode::Add, &[lit(8, 0b1011_0001), DATA]),
        ];
        let err = EncodingTable::new(rows).unwrap_err();
        assert_eq!(
            err,
            TableError::Ambiguous {
                first: 0,
                first_opcode: Opcode::Mov,
                second: 1,
                second_opcode: Opcode::Add,
            }
        );
    }

    #[test]
    fn test_rows_differing_only_in_second_byte_are_distinct() {
        let rows = [
            EncodingRow::new(Opcode::Add, &[lit(6, 0b100000), S, W, MOD, lit(3, 0b000), RM, DATA]),
            EncodingRow::new(Opcode::Sub, &[lit(6, 0b100000), S, W, MOD, lit(3, 0b101), RM, DATA]),
        ];
        assert!(EncodingTable::new(rows).is_ok());
    }

    #[test]
    fn test_misaligned_and_empty_rows_are_rejected() {
        let straddling = [EncodingRow::new(Opcode::Mov, &[lit(6, 0b100010), D, MOD, W, REG, RM])];
        assert!(matches!(
            EncodingTable::new(straddling),
            Err(TableError::MisalignedField { row: 0, bit: 7, .. })
        ));

        let short = [EncodingRow::new(Opcode::Mov, &[lit(4, 0b1011), W])];
        assert!(matches!(
            EncodingTable::new(short),
            Err(TableError::MisalignedField { row: 0, bit: 5, .. })
        ));

        let empty = [EncodingRow::new(Opcode::Ret, &[DATA])];
        assert!(matches!(
            EncodingTable::new(empty),
            Err(TableError::EmptyRow { row: 0, .. })
        ));
    }
}
