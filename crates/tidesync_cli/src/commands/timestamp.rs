//! Timestamp command implementation.

use tidesync_engine::protocol::{RawTimestamp, Timestamp, TimestampEncoding};

/// Runs the timestamp command.
pub fn run(value: &str, encoding: TimestampEncoding) -> Result<(), Box<dyn std::error::Error>> {
    let timestamp = decode(value, encoding)?;

    println!("Canonical: {}", timestamp.value());
    println!("Integer:   {}", timestamp.value());
    println!("Hex:       {:X}", timestamp.value());
    println!("Bytes:     {}", hex::encode(timestamp.value().to_be_bytes()));

    Ok(())
}

/// Decodes `value` as the store would have reported it.
pub fn decode(value: &str, encoding: TimestampEncoding) -> Result<Timestamp, Box<dyn std::error::Error>> {
    let value = value.trim();
    let raw = match encoding {
        TimestampEncoding::Integer if value.eq_ignore_ascii_case("null") => RawTimestamp::Null,
        TimestampEncoding::Integer => RawTimestamp::Integer(value.parse::<i128>()?),
        TimestampEncoding::HexString => RawTimestamp::HexString(value.to_string()),
        TimestampEncoding::Bytes => {
            let digits = value.strip_prefix("0x").unwrap_or(value);
            RawTimestamp::Bytes(hex::decode(digits)?)
        }
    };
    Ok(Timestamp::parse(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_shape_decodes_to_the_same_value() {
        let expected = Timestamp::new(0x1F4);
        assert_eq!(decode("500", TimestampEncoding::Integer).unwrap(), expected);
        assert_eq!(decode("0x1f4", TimestampEncoding::HexString).unwrap(), expected);
        assert_eq!(
            decode("00000000000001F4", TimestampEncoding::Bytes).unwrap(),
            expected
        );
        assert_eq!(
            decode("null", TimestampEncoding::Integer).unwrap(),
            Timestamp::ZERO
        );
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(decode("-1", TimestampEncoding::Integer).is_err());
        assert!(decode("xyz", TimestampEncoding::HexString).is_err());
        assert!(decode("abc", TimestampEncoding::Bytes).is_err());
    }
}
