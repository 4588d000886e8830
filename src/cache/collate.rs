//! Natural, case-insensitive string comparison backing the NATURALNOCASE
//! collation.
//!
//! Embedded integer runs compare by value, so `file9` sorts before `file10`,
//! and letters compare case-insensitively. Every name-ordered query of the
//! node cache goes through this.

use std::cmp::Ordering;

/// Compares two UTF-8 strings naturally and case-insensitively.
pub fn natural_nocase_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(lc), Some(rc)) => {
                if lc.is_ascii_digit() && rc.is_ascii_digit() {
                    let ln = take_digits(&mut left);
                    let rn = take_digits(&mut right);
                    let ordering = compare_digit_runs(&ln, &rn);
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                } else {
                    let ordering = fold(lc).cmp(&fold(rc));
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                    left.next();
                    right.next();
                }
            }
        }
    }
}

fn fold(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

fn take_digits(it: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(&c) = it.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        run.push(c);
        it.next();
    }
    run
}

/// Numeric comparison of two digit runs of arbitrary length. Leading zeros
/// lose ties so the order stays total.
fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let at = a.trim_start_matches('0');
    let bt = b.trim_start_matches('0');
    at.len()
        .cmp(&bt.len())
        .then_with(|| at.cmp(bt))
        .then_with(|| a.len().cmp(&b.len()))
}
