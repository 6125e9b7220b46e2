//! Transmit report decoder
//!
//! Recovers an oracle's published answer directly from the raw bytes of its
//! on-chain "transmit" call, independent of event logs. Two historical call
//! signatures are supported; both carry the same opaque report payload whose
//! third word points at a dynamic array of 192-bit signed observations, each
//! stored sign-extended in a full 32-byte word. Everything here is pure and
//! returns None on any structural violation.

use ethers::abi::{decode as abi_decode, ParamType, Token};
use ethers::types::{I256, U256};

/// Known shapes of the transmit call signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitVariant {
    /// transmit(bytes32[3] reportContext, bytes report, bytes32[] rs, bytes32[] ss, bytes32 rawVs)
    Ocr2,
    /// transmit(bytes report, bytes32[] rs, bytes32[] ss, bytes32 rawVs)
    Ocr,
}

impl TransmitVariant {
    fn params(&self) -> Vec<ParamType> {
        match self {
            TransmitVariant::Ocr2 => vec![
                ParamType::FixedArray(Box::new(ParamType::FixedBytes(32)), 3),
                ParamType::Bytes,
                ParamType::Array(Box::new(ParamType::FixedBytes(32))),
                ParamType::Array(Box::new(ParamType::FixedBytes(32))),
                ParamType::FixedBytes(32),
            ],
            TransmitVariant::Ocr => vec![
                ParamType::Bytes,
                ParamType::Array(Box::new(ParamType::FixedBytes(32))),
                ParamType::Array(Box::new(ParamType::FixedBytes(32))),
                ParamType::FixedBytes(32),
            ],
        }
    }

    fn report_index(&self) -> usize {
        match self {
            TransmitVariant::Ocr2 => 1,
            TransmitVariant::Ocr => 0,
        }
    }
}

/// Identify which transmit signature the calldata matches, by attempting to
/// unpack each known layout in turn. Returns the first that parses.
pub fn detect_variant(call_data: &[u8]) -> Option<TransmitVariant> {
    [TransmitVariant::Ocr2, TransmitVariant::Ocr]
        .into_iter()
        .find(|variant| report_bytes(*variant, call_data).is_some())
}

/// Recover the published answer from transmit calldata of a known variant.
pub fn decode(variant: TransmitVariant, call_data: &[u8]) -> Option<I256> {
    let report = report_bytes(variant, call_data)?;
    let observations = decode_report(&report)?;
    median_observation(&observations)
}

/// Detect the variant and decode in one step.
pub fn decode_any(call_data: &[u8]) -> Option<(TransmitVariant, I256)> {
    let variant = detect_variant(call_data)?;
    let answer = decode(variant, call_data)?;
    Some((variant, answer))
}

/// Decode 0x-hex transmit calldata, as copied out of an explorer or a raw
/// pending transaction. Convenience for ad-hoc verification tooling.
pub fn decode_hex(call_data: &str) -> Option<(TransmitVariant, I256)> {
    let stripped = call_data.trim().trim_start_matches("0x");
    let bytes = hex::decode(stripped).ok()?;
    decode_any(&bytes)
}

/// Extract the opaque report payload from the outer calldata.
fn report_bytes(variant: TransmitVariant, call_data: &[u8]) -> Option<Vec<u8>> {
    // 4-byte selector precedes the ABI-encoded arguments
    if call_data.len() < 4 {
        return None;
    }
    let tokens = abi_decode(&variant.params(), &call_data[4..]).ok()?;
    match tokens.into_iter().nth(variant.report_index()) {
        Some(Token::Bytes(bytes)) => Some(bytes),
        _ => None,
    }
}

/// Walk the report payload and recover the signed observation list.
///
/// Layout: two 32-byte header words, then a word holding the byte offset of
/// the observations array; at that offset a length word, then `length`
/// 32-byte words each carrying one sign-extended 192-bit observation.
pub fn decode_report(report: &[u8]) -> Option<Vec<I256>> {
    if report.len() < 96 {
        return None;
    }

    let offset = word_as_offset(&report[64..96])?;
    let length_end = offset.checked_add(32)?;
    if length_end > report.len() {
        return None;
    }
    let length = word_as_offset(&report[offset..length_end])?;
    let array_end = length_end.checked_add(length.checked_mul(32)?)?;
    if array_end > report.len() {
        return None;
    }

    let mut observations = Vec::with_capacity(length);
    for i in 0..length {
        let start = length_end + i * 32;
        let raw = U256::from_big_endian(&report[start..start + 32]);
        // two's-complement reinterpretation: values >= 2^255 wrap negative,
        // recovering the sign-extended 192-bit observation
        observations.push(I256::from_raw(raw));
    }
    Some(observations)
}

/// Median of an observation list, lower-middle on even counts — the same
/// reduction the oracle network applies.
pub fn median_observation(observations: &[I256]) -> Option<I256> {
    if observations.is_empty() {
        return None;
    }
    let mut sorted = observations.to_vec();
    sorted.sort();
    Some(sorted[(sorted.len() - 1) / 2])
}

fn word_as_offset(word: &[u8]) -> Option<usize> {
    let value = U256::from_big_endian(word);
    // offsets/lengths beyond u32 cannot be in-range for any real payload
    if value > U256::from(u32::MAX) {
        return None;
    }
    Some(value.as_usize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::encode as abi_encode;

    /// Build a report payload: context word, observers word, offset word,
    /// then the observations array.
    fn encode_report(observations: &[I256]) -> Vec<u8> {
        let mut report = Vec::new();
        report.extend_from_slice(&[0u8; 32]); // raw report context
        report.extend_from_slice(&[0u8; 32]); // observer bitmap
        let mut offset_word = [0u8; 32];
        U256::from(96u64).to_big_endian(&mut offset_word);
        report.extend_from_slice(&offset_word);

        let mut len_word = [0u8; 32];
        U256::from(observations.len()).to_big_endian(&mut len_word);
        report.extend_from_slice(&len_word);
        for obs in observations {
            let mut word = [0u8; 32];
            obs.into_raw().to_big_endian(&mut word);
            report.extend_from_slice(&word);
        }
        report
    }

    fn encode_ocr2_calldata(report: Vec<u8>) -> Vec<u8> {
        let context = Token::FixedArray(vec![Token::FixedBytes(vec![0u8; 32]); 3]);
        let body = abi_encode(&[
            context,
            Token::Bytes(report),
            Token::Array(vec![Token::FixedBytes(vec![1u8; 32])]),
            Token::Array(vec![Token::FixedBytes(vec![2u8; 32])]),
            Token::FixedBytes(vec![0u8; 32]),
        ]);
        let mut call = vec![0xb1, 0xdc, 0x65, 0xa4];
        call.extend_from_slice(&body);
        call
    }

    fn encode_ocr_calldata(report: Vec<u8>) -> Vec<u8> {
        let body = abi_encode(&[
            Token::Bytes(report),
            Token::Array(vec![Token::FixedBytes(vec![1u8; 32])]),
            Token::Array(vec![Token::FixedBytes(vec![2u8; 32])]),
            Token::FixedBytes(vec![0u8; 32]),
        ]);
        let mut call = vec![0xc9, 0x80, 0x75, 0x39];
        call.extend_from_slice(&body);
        call
    }

    fn obs(values: &[i64]) -> Vec<I256> {
        values.iter().map(|v| I256::from(*v)).collect()
    }

    #[test]
    fn report_round_trips_observations_and_median() {
        let observations = obs(&[6_500_000_000_000, 6_500_100_000_000, 6_499_900_000_000]);
        let decoded = decode_report(&encode_report(&observations)).unwrap();
        assert_eq!(decoded, observations);
        assert_eq!(
            median_observation(&decoded),
            Some(I256::from(6_500_000_000_000i64))
        );
    }

    #[test]
    fn report_round_trips_negatives_near_192_bit_boundary() {
        // -(2^191) and 2^191 - 1: the extremes of int192
        let min = I256::from_dec_str(
            "-3138550867693340381917894711603833208051177722232017256448",
        )
        .unwrap();
        let max = I256::from_dec_str(
            "3138550867693340381917894711603833208051177722232017256447",
        )
        .unwrap();
        let observations = vec![min, I256::from(-1), max];

        let decoded = decode_report(&encode_report(&observations)).unwrap();
        assert_eq!(decoded, observations);
        // sorted: [min, -1, max] -> middle element
        assert_eq!(median_observation(&decoded), Some(I256::from(-1)));
    }

    #[test]
    fn median_observation_even_count_uses_lower_middle() {
        let observations = obs(&[1, 2, 3, 4]);
        assert_eq!(median_observation(&observations), Some(I256::from(2)));
        assert_eq!(median_observation(&[]), None);
    }

    #[test]
    fn decode_report_rejects_malformed_payloads() {
        // empty and too-short inputs
        assert_eq!(decode_report(&[]), None);
        assert_eq!(decode_report(&[0u8; 95]), None);

        // offset pointing past the end
        let mut report = vec![0u8; 96];
        let mut word = [0u8; 32];
        U256::from(4_096u64).to_big_endian(&mut word);
        report[64..96].copy_from_slice(&word);
        assert_eq!(decode_report(&report), None);

        // length implying more bytes than are present
        let mut report = encode_report(&obs(&[1, 2, 3]));
        let mut len_word = [0u8; 32];
        U256::from(1_000u64).to_big_endian(&mut len_word);
        report[96..128].copy_from_slice(&len_word);
        assert_eq!(decode_report(&report), None);

        // absurd offset word (beyond u32)
        let mut report = vec![0u8; 96];
        report[64] = 0xff;
        assert_eq!(decode_report(&report), None);
    }

    #[test]
    fn detect_variant_matches_both_call_shapes() {
        let report = encode_report(&obs(&[100, 101, 102]));

        let ocr2 = encode_ocr2_calldata(report.clone());
        assert_eq!(detect_variant(&ocr2), Some(TransmitVariant::Ocr2));
        assert_eq!(
            decode_any(&ocr2).map(|(_, answer)| answer),
            Some(I256::from(101))
        );

        let ocr = encode_ocr_calldata(report);
        assert_eq!(detect_variant(&ocr), Some(TransmitVariant::Ocr));
        assert_eq!(decode(TransmitVariant::Ocr, &ocr), Some(I256::from(101)));
    }

    #[test]
    fn detect_variant_rejects_garbage() {
        assert_eq!(detect_variant(&[]), None);
        assert_eq!(detect_variant(&[0x01, 0x02, 0x03]), None);
        assert_eq!(detect_variant(&[0u8; 8]), None);
        assert_eq!(decode_any(&[0xde, 0xad, 0xbe, 0xef, 0x00]), None);
    }

    #[test]
    fn decode_hex_accepts_prefixed_calldata() {
        let call = encode_ocr2_calldata(encode_report(&obs(&[7, 8, 9])));
        let hex_call = format!("0x{}", hex::encode(&call));

        assert_eq!(
            decode_hex(&hex_call).map(|(_, answer)| answer),
            Some(I256::from(8))
        );
        assert_eq!(decode_hex("0xzz"), None);
    }
}
