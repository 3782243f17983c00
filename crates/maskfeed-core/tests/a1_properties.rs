use maskfeed_core::a1::{column_index, column_letters};
use proptest::prelude::*;
use proptest::test_runner::Config;

fn code_len(index: u64) -> usize {
    // Codes of length k cover indices [(26^k - 26) / 25, (26^(k+1) - 26) / 25).
    let index = u128::from(index);
    (1..=14u32)
        .find(|k| index < (26u128.pow(k + 1) - 26) / 25)
        .map(|k| k as usize)
        .unwrap_or(14)
}

proptest! {
    #![proptest_config(Config::with_cases(512))]
    #[test]
    fn letters_roundtrip(index in any::<u64>()) {
        let letters = column_letters(index);
        prop_assert!(letters.chars().all(|c| c.is_ascii_uppercase()));
        prop_assert_eq!(column_index(&letters), Some(index));
    }

    #[test]
    fn letters_strictly_increase(index in 0_u64..1_000_000_u64) {
        let a = column_letters(index);
        let b = column_letters(index + 1);
        prop_assert!((a.len(), a.as_str()) < (b.len(), b.as_str()));
    }

    #[test]
    fn length_matches_bucket(index in 0_u64..10_000_000_u64) {
        prop_assert_eq!(column_letters(index).len(), code_len(index));
    }
}

#[test]
fn length_grows_exactly_at_powers_of_26() {
    for boundary in [26_u64, 702, 18_278, 475_254] {
        assert_eq!(
            column_letters(boundary).len(),
            column_letters(boundary - 1).len() + 1
        );
    }
}
