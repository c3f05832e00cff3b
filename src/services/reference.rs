use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};

/// `PREFIX-YYYYMMDDHHMMSS-XXXXXX`, e.g. `TRF-20260116093015-4KQ7ZP`.
pub fn generate_reference(prefix: &str, at: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect();
    format!("{}-{}-{}", prefix, at.format("%Y%m%d%H%M%S"), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn reference_layout() {
        let at = Utc.with_ymd_and_hms(2026, 1, 16, 9, 30, 15).unwrap();
        let reference = generate_reference("TRF", at);
        let parts: Vec<&str> = reference.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "TRF");
        assert_eq!(parts[1], "20260116093015");
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2]
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }
}
