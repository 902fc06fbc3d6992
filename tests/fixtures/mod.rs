//! Sample payloads used across integration tests.

/// Binary payload exercising every byte value.
pub fn binary_payload() -> Vec<u8> {
    (0..=255u8).cycle().take(2048).collect()
}

/// File names covering ascii, unicode, and awkward-but-legal cases.
pub fn sample_file_names() -> Vec<&'static str> {
    vec!["report-2025.zip", "отчёт.zip", "月次報告.tar.gz"]
}
