//! Payload encoding and display for the command-line tool.

/// Fixed-size payload for message `seq`: `text` padded with zeros or
/// truncated, or the little-endian sequence number when no text is given.
pub fn build(msg_size: usize, text: Option<&str>, seq: u64) -> Vec<u8> {
    let mut out = vec![0u8; msg_size];
    let src = match text {
        Some(text) => text.as_bytes().to_vec(),
        None => seq.to_le_bytes().to_vec(),
    };
    let n = src.len().min(msg_size);
    out[..n].copy_from_slice(&src[..n]);
    out
}

/// Printable rendering: text up to the first NUL when that prefix is
/// non-empty UTF-8 without control characters, hex otherwise.
pub fn render(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    let prefix = &payload[..end];
    if let Ok(text) = std::str::from_utf8(prefix)
        && !text.is_empty()
        && !text.chars().any(char::is_control)
    {
        return text.to_string();
    }
    let trimmed = payload.len() - payload.iter().rev().take_while(|&&b| b == 0).count();
    let shown = &payload[..trimmed.max(1).min(payload.len())];
    let hex: String = shown.iter().map(|b| format!("{b:02x}")).collect();
    if shown.len() < payload.len() {
        format!("0x{hex}..")
    } else {
        format!("0x{hex}")
    }
}
