//! ============================================================================
//! Attestation Data Codec
//! ============================================================================
//! ABI-style tuple encoding for the records carried in attestation data:
//! - Demand: (string provider, string model, string promptTemplate, string demand)
//! - Obligation payload: (string item)
//! - Escrow terms: (address arbiter, bytes demand)
//! - Decision: (bool decision)
//!
//! Dynamic tuples are prefixed with a 0x20 offset word, matching what an
//! `abi.encode(struct)` call produces on-chain.
//! ============================================================================

use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};

use crate::types::*;

const WORD: usize = 32;

/// Schema id of the obligation payload `{item: string}`
pub static OBLIGATION_SCHEMA: Lazy<Uid> = Lazy::new(|| schema_id("string item"));

/// Schema id of escrow attestations
pub static ESCROW_SCHEMA: Lazy<Uid> = Lazy::new(|| schema_id("address arbiter, bytes demand"));

/// Schema id of decision attestations
pub static DECISION_SCHEMA: Lazy<Uid> = Lazy::new(|| schema_id("bool decision"));

/// Derive a schema id from its field signature
pub fn schema_id(signature: &str) -> Uid {
    Uid(Sha256::digest(signature.as_bytes()).into())
}

// ============================================================================
// Public record codecs
// ============================================================================

/// Encode a demand. No content validation: empty strings are encoded as-is.
pub fn encode_demand(demand: &Demand) -> Vec<u8> {
    encode_dynamic_tuple(&[
        Token::Bytes(demand.provider.as_bytes()),
        Token::Bytes(demand.model.as_bytes()),
        Token::Bytes(demand.prompt_template.as_bytes()),
        Token::Bytes(demand.demand_text.as_bytes()),
    ])
}

/// Decode and validate a demand.
///
/// Structural failures surface as [`OracleError::Decode`]; demands that decode
/// but carry NUL bytes or empty required fields surface as
/// [`OracleError::MalformedDemand`].
pub fn decode_demand(data: &[u8]) -> Result<Demand, OracleError> {
    let demand = decode_demand_unchecked(data)?;
    demand.validate()?;
    Ok(demand)
}

/// Structural decode only
pub fn decode_demand_unchecked(data: &[u8]) -> Result<Demand, OracleError> {
    let reader = TupleReader::dynamic(data, 4)?;
    Ok(Demand {
        provider: reader.string(0)?,
        model: reader.string(1)?,
        prompt_template: reader.string(2)?,
        demand_text: reader.string(3)?,
    })
}

pub fn encode_obligation_item(item: &str) -> Vec<u8> {
    encode_dynamic_tuple(&[Token::Bytes(item.as_bytes())])
}

pub fn decode_obligation_item(data: &[u8]) -> Result<String, OracleError> {
    TupleReader::dynamic(data, 1)?.string(0)
}

pub fn encode_escrow_terms(terms: &EscrowTerms) -> Vec<u8> {
    encode_dynamic_tuple(&[Token::Address(&terms.arbiter), Token::Bytes(&terms.demand)])
}

pub fn decode_escrow_terms(data: &[u8]) -> Result<EscrowTerms, OracleError> {
    let reader = TupleReader::dynamic(data, 2)?;
    Ok(EscrowTerms {
        arbiter: reader.address(0)?,
        demand: reader.bytes(1)?.to_vec(),
    })
}

pub fn encode_decision(decision: bool) -> Vec<u8> {
    encode_tuple(&[Token::Bool(decision)])
}

pub fn decode_decision(data: &[u8]) -> Result<bool, OracleError> {
    TupleReader::fixed(data, 1)?.bool(0)
}

// ============================================================================
// Encoding
// ============================================================================

enum Token<'a> {
    Address(&'a Address),
    Bool(bool),
    /// `bytes` or UTF-8 `string`
    Bytes(&'a [u8]),
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(WORD) * WORD
}

fn uint_word(value: u64) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - 8..].copy_from_slice(&value.to_be_bytes());
    word
}

fn encode_tuple(tokens: &[Token<'_>]) -> Vec<u8> {
    let head_len = tokens.len() * WORD;
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for token in tokens {
        match token {
            Token::Address(addr) => {
                head.extend_from_slice(&[0u8; WORD - Address::LEN]);
                head.extend_from_slice(addr.as_bytes());
            }
            Token::Bool(b) => head.extend_from_slice(&uint_word(*b as u64)),
            Token::Bytes(bytes) => {
                head.extend_from_slice(&uint_word((head_len + tail.len()) as u64));
                tail.extend_from_slice(&uint_word(bytes.len() as u64));
                tail.extend_from_slice(bytes);
                tail.resize(tail.len() + padded_len(bytes.len()) - bytes.len(), 0);
            }
        }
    }

    head.extend(tail);
    head
}

fn encode_dynamic_tuple(tokens: &[Token<'_>]) -> Vec<u8> {
    let mut out = uint_word(WORD as u64).to_vec();
    out.extend(encode_tuple(tokens));
    out
}

// ============================================================================
// Decoding
// ============================================================================

struct TupleReader<'a> {
    body: &'a [u8],
    fields: usize,
}

impl<'a> TupleReader<'a> {
    /// Tuple preceded by its 0x20 offset word
    fn dynamic(data: &'a [u8], fields: usize) -> Result<Self, OracleError> {
        if data.len() % WORD != 0 {
            return Err(decode_err(format!(
                "length {} is not a multiple of {}",
                data.len(),
                WORD
            )));
        }
        if data.len() < WORD {
            return Err(decode_err("missing tuple offset word"));
        }
        let offset = read_uint(&data[..WORD])?;
        if offset != WORD {
            return Err(decode_err(format!("unexpected tuple offset {}", offset)));
        }
        let body = &data[WORD..];
        if body.len() < fields * WORD {
            return Err(decode_err(format!(
                "expected {} head words, found {}",
                fields,
                body.len() / WORD
            )));
        }
        Ok(Self { body, fields })
    }

    /// Tuple of static fields, exact length
    fn fixed(data: &'a [u8], fields: usize) -> Result<Self, OracleError> {
        if data.len() != fields * WORD {
            return Err(decode_err(format!(
                "expected {} bytes, found {}",
                fields * WORD,
                data.len()
            )));
        }
        Ok(Self { body: data, fields })
    }

    fn word(&self, index: usize) -> &'a [u8] {
        &self.body[index * WORD..(index + 1) * WORD]
    }

    fn bytes(&self, index: usize) -> Result<&'a [u8], OracleError> {
        let offset = read_uint(self.word(index))?;
        if offset % WORD != 0 || offset < self.fields * WORD {
            return Err(decode_err(format!("field {} has invalid offset {}", index, offset)));
        }
        let len_end = offset
            .checked_add(WORD)
            .filter(|end| *end <= self.body.len())
            .ok_or_else(|| decode_err(format!("field {} offset out of bounds", index)))?;
        let len = read_uint(&self.body[offset..len_end])?;
        if len > self.body.len() {
            return Err(decode_err(format!("field {} length {} out of bounds", index, len)));
        }
        let padded_end = len_end
            .checked_add(padded_len(len))
            .filter(|end| *end <= self.body.len())
            .ok_or_else(|| decode_err(format!("field {} length {} out of bounds", index, len)))?;
        let end = len_end + len;
        if self.body[end..padded_end].iter().any(|b| *b != 0) {
            return Err(decode_err(format!("field {} has non-zero padding", index)));
        }
        Ok(&self.body[len_end..end])
    }

    fn string(&self, index: usize) -> Result<String, OracleError> {
        let bytes = self.bytes(index)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| decode_err(format!("field {} is not UTF-8: {}", index, e)))
    }

    fn address(&self, index: usize) -> Result<Address, OracleError> {
        let word = self.word(index);
        let (pad, addr) = word.split_at(WORD - Address::LEN);
        if pad.iter().any(|b| *b != 0) {
            return Err(decode_err(format!("field {} is not an address", index)));
        }
        Address::from_slice(addr)
    }

    fn bool(&self, index: usize) -> Result<bool, OracleError> {
        match read_uint(self.word(index))? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(decode_err(format!("field {} is not a bool: {}", index, other))),
        }
    }
}

fn read_uint(word: &[u8]) -> Result<usize, OracleError> {
    let (high, low) = word.split_at(WORD - 8);
    if high.iter().any(|b| *b != 0) {
        return Err(decode_err("integer word exceeds 64 bits"));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(low);
    usize::try_from(u64::from_be_bytes(buf)).map_err(|_| decode_err("integer word exceeds usize"))
}

fn decode_err(msg: impl Into<String>) -> OracleError {
    OracleError::Decode(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Demand {
        Demand {
            provider: "OpenAI".into(),
            model: "gpt-4o-mini".into(),
            prompt_template: "Demand: {{demand}}\nFulfillment: {{obligation}}".into(),
            demand_text: "The sky is blue".into(),
        }
    }

    #[test]
    fn test_demand_roundtrip() {
        let demands = [
            sample(),
            Demand {
                provider: String::new(),
                prompt_template: String::new(),
                ..sample()
            },
            Demand {
                demand_text: "ünïcødé ✓ and a string that is definitely longer than one word".into(),
                ..sample()
            },
        ];
        for demand in demands {
            let encoded = encode_demand(&demand);
            assert_eq!(encoded.len() % 32, 0);
            assert_eq!(decode_demand(&encoded).unwrap(), demand);
        }
    }

    #[test]
    fn test_demand_layout() {
        let encoded = encode_demand(&sample());
        // outer offset, then four head offsets relative to the tuple body
        assert_eq!(read_uint(&encoded[0..32]).unwrap(), 32);
        assert_eq!(read_uint(&encoded[32..64]).unwrap(), 128);
        // "OpenAI" occupies length word + one data word
        assert_eq!(read_uint(&encoded[64..96]).unwrap(), 192);
        assert_eq!(read_uint(&encoded[160..192]).unwrap(), 6);
        assert_eq!(&encoded[192..198], b"OpenAI");
    }

    #[test]
    fn test_encoding_is_deterministic() {
        assert_eq!(encode_demand(&sample()), encode_demand(&sample()));
    }

    #[test]
    fn test_non_tuple_bytes_are_decode_errors() {
        let mut wrong_offset = encode_demand(&sample());
        wrong_offset[31] = 0x40;

        let mut truncated = encode_demand(&sample());
        truncated.truncate(truncated.len() - 32);

        let mut dirty_padding = encode_demand(&sample());
        // byte right after "OpenAI" inside its padded word
        dirty_padding[32 + 160 + 6] = 0xff;

        let single_field = encode_obligation_item("only one field");

        let cases: Vec<Vec<u8>> = vec![
            vec![],
            b"hello world".to_vec(),
            vec![0u8; 32],
            vec![0xffu8; 160],
            wrong_offset,
            truncated,
            dirty_padding,
            single_field,
        ];

        for bytes in cases {
            let err = decode_demand(&bytes).unwrap_err();
            assert_eq!(err.kind(), "decode_error", "input {:?}", hex::encode(&bytes));
        }
    }

    #[test]
    fn test_invalid_utf8_is_decode_error() {
        let raw = encode_dynamic_tuple(&[
            Token::Bytes(b"OpenAI"),
            Token::Bytes(&[0xc3, 0x28]),
            Token::Bytes(b"t"),
            Token::Bytes(b"d"),
        ]);
        assert_eq!(decode_demand(&raw).unwrap_err().kind(), "decode_error");
    }

    #[test]
    fn test_nul_in_model_is_malformed() {
        let demand = Demand {
            model: "gpt-4o\0\0\0".into(),
            ..sample()
        };
        let encoded = encode_demand(&demand);
        // structurally fine
        assert_eq!(decode_demand_unchecked(&encoded).unwrap(), demand);
        assert_eq!(decode_demand(&encoded).unwrap_err().kind(), "malformed_demand");
    }

    #[test]
    fn test_empty_demand_text_is_malformed() {
        let demand = Demand {
            demand_text: String::new(),
            ..sample()
        };
        let err = decode_demand(&encode_demand(&demand)).unwrap_err();
        assert!(matches!(err, OracleError::MalformedDemand(_)));
    }

    #[test]
    fn test_escrow_terms_roundtrip() {
        let terms = EscrowTerms {
            arbiter: Address([0x11; 20]),
            demand: encode_demand(&sample()),
        };
        let decoded = decode_escrow_terms(&encode_escrow_terms(&terms)).unwrap();
        assert_eq!(decoded, terms);
    }

    #[test]
    fn test_obligation_item_and_decision() {
        let item = "The sky appears blue today";
        assert_eq!(decode_obligation_item(&encode_obligation_item(item)).unwrap(), item);
        assert!(decode_decision(&encode_decision(true)).unwrap());
        assert!(!decode_decision(&encode_decision(false)).unwrap());
        assert!(decode_decision(&uint_word(2)).is_err());
    }

    #[test]
    fn test_schema_ids_are_distinct() {
        assert_ne!(*OBLIGATION_SCHEMA, *ESCROW_SCHEMA);
        assert_ne!(*ESCROW_SCHEMA, *DECISION_SCHEMA);
        assert_eq!(*OBLIGATION_SCHEMA, schema_id("string item"));
    }
}
