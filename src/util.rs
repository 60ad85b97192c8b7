//! Small shared utilities

/// Format bytes as hex string with spaces between each byte
/// Example: [0x68, 0x04, 0x07] -> "68 04 07"
#[inline]
pub fn format_hex_pretty(data: &[u8]) -> String {
    hex::encode_upper(data)
        .chars()
        .collect::<Vec<_>>()
        .chunks(2)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
}
