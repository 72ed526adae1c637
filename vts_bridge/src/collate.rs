//! Case- and accent-insensitive ordering for display labels.
//!
//! Approximates the root collation order: punctuation and symbols first, then
//! digits, then letters. Katakana and hiragana share one primary weight.

use std::cmp::Ordering;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Class {
    Symbol,
    Digit,
    Letter,
}

fn class_of(c: char) -> Class {
    if c.is_numeric() {
        Class::Digit
    } else if c.is_alphabetic() {
        Class::Letter
    } else {
        Class::Symbol
    }
}

/// Katakana ァ..ヶ sit exactly 0x60 above their hiragana counterparts.
fn kana_fold(c: char) -> char {
    match c {
        '\u{30A1}'..='\u{30F6}' => char::from_u32(c as u32 - 0x60).unwrap_or(c),
        _ => c,
    }
}

fn fold(label: &str) -> Vec<(Class, char)> {
    label
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(kana_fold)
        .map(|c| (class_of(c), c))
        .collect()
}

/// Lowercase wins at the first position where the labels differ only by case.
fn case_tiebreak(a: &str, b: &str) -> Ordering {
    for (x, y) in a.chars().zip(b.chars()) {
        if x == y {
            continue;
        }
        if x.is_lowercase() && y.is_uppercase() {
            return Ordering::Less;
        }
        if x.is_uppercase() && y.is_lowercase() {
            return Ordering::Greater;
        }
        break;
    }
    Ordering::Equal
}

pub fn locale_cmp(a: &str, b: &str) -> Ordering {
    fold(a)
        .cmp(&fold(b))
        .then_with(|| case_tiebreak(a, b))
        .then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(labels: &[&str]) -> Vec<String> {
        let mut v: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        v.sort_by(|a, b| locale_cmp(a, b));
        v
    }

    #[test]
    fn case_does_not_dominate() {
        assert_eq!(sorted(&["Bravo", "alpha"]), vec!["alpha", "Bravo"]);
        assert_eq!(sorted(&["zeta", "Alpha", "beta"]), vec!["Alpha", "beta", "zeta"]);
    }

    #[test]
    fn accents_sort_with_their_base_letter() {
        assert_eq!(sorted(&["Zoe", "Émile", "Eva"]), vec!["Émile", "Eva", "Zoe"]);
    }

    #[test]
    fn symbols_sort_before_digits_and_letters() {
        assert_eq!(sorted(&["Alpha", "~Wave"]), vec!["~Wave", "Alpha"]);
        assert_eq!(sorted(&["b", "2b", "_b"]), vec!["_b", "2b", "b"]);
    }

    #[test]
    fn hiragana_and_katakana_interleave() {
        assert_eq!(sorted(&["きつね", "カメラ"]), vec!["カメラ", "きつね"]);
        assert_eq!(sorted(&["カ", "か"]), vec!["か", "カ"]);
    }

    #[test]
    fn lowercase_first_on_case_ties() {
        assert_eq!(sorted(&["Wave", "wave"]), vec!["wave", "Wave"]);
        assert_eq!(locale_cmp("same", "same"), Ordering::Equal);
    }
}
