use std::sync::OnceLock;

use regex::Regex;

/// Mod-11 check digit over the 13-digit Thai national ID. Digits 1-12 are
/// weighted 13 down to 2; the check digit is (11 - sum mod 11) mod 10.
pub fn is_valid_citizen_id(id: &str) -> bool {
    let digits: Vec<u32> = id.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 13 || id.len() != 13 {
        return false;
    }
    let sum: u32 = digits[..12]
        .iter()
        .enumerate()
        .map(|(i, d)| d * (13 - i as u32))
        .sum();
    (11 - sum % 11) % 10 == digits[12]
}

static PASSPORT_RE: OnceLock<Regex> = OnceLock::new();

/// Passport numbers: one or two letters followed by 6-7 digits.
pub fn is_valid_passport(no: &str) -> bool {
    PASSPORT_RE
        .get_or_init(|| Regex::new(r"^[A-Z]{1,2}[0-9]{6,7}$").unwrap())
        .is_match(no)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Build an ID whose check digit satisfies the mod-11 rule.
    fn with_check_digit(first12: &str) -> String {
        let digits: Vec<u32> = first12.chars().map(|c| c.to_digit(10).unwrap()).collect();
        let sum: u32 = digits
            .iter()
            .enumerate()
            .map(|(i, d)| d * (13 - i as u32))
            .sum();
        let check = (11 - sum % 11) % 10;
        format!("{first12}{check}")
    }

    #[test]
    fn accepts_ids_with_matching_check_digit() {
        assert!(is_valid_citizen_id(&with_check_digit("110170020345")));
        assert!(is_valid_citizen_id(&with_check_digit("350990123456")));
    }

    #[test]
    fn rejects_wrong_check_digit() {
        let good = with_check_digit("110170020345");
        let check = good.chars().last().unwrap().to_digit(10).unwrap();
        let bad = format!("{}{}", &good[..12], (check + 1) % 10);
        assert!(!is_valid_citizen_id(&bad));
    }

    #[test]
    fn rejects_wrong_length_and_non_digits() {
        assert!(!is_valid_citizen_id(""));
        assert!(!is_valid_citizen_id("12345"));
        assert!(!is_valid_citizen_id("1234567890123456"));
        assert!(!is_valid_citizen_id("12345678901ab"));
    }

    #[test]
    fn passport_formats() {
        assert!(is_valid_passport("AA1234567"));
        assert!(is_valid_passport("K123456"));
        assert!(!is_valid_passport("k123456"));
        assert!(!is_valid_passport("ABC123456"));
        assert!(!is_valid_passport("A12345"));
        assert!(!is_valid_passport("A12345678"));
    }
}
