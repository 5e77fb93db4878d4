// Copyright 2025 The Tenama Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Namespace name canonicalization.
//!
//! Cluster object names must be RFC 1123 labels: lowercase alphanumerics and
//! dashes, starting and ending alphanumeric, at most 63 characters.

use rand::Rng;
use thiserror::Error;

/// Separator inserted between name segments.
pub const SEPARATOR: char = '-';

/// Maximum length of an RFC 1123 label.
pub const MAX_LABEL_LEN: usize = 63;

/// Alphabet for generated name suffixes.
const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of a generated name suffix.
pub const GENERATED_SUFFIX_LEN: usize = 5;

/// Error returned when canonicalization consumes the entire input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("name {0:?} is empty after removing invalid characters")]
pub struct EmptyNameError(pub String);

/// Joins the given segments with `-` and canonicalizes the result into a
/// valid RFC 1123 label: lowercased, invalid characters replaced by `-`,
/// truncated to 63 characters, leading and trailing dashes stripped.
pub fn canonicalize(segments: &[&str]) -> Result<String, EmptyNameError> {
    let joined = segments.join(&SEPARATOR.to_string());

    let replaced: String = joined
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == SEPARATOR {
                c
            } else {
                SEPARATOR
            }
        })
        .take(MAX_LABEL_LEN)
        .collect();

    let name = replaced.trim_matches(SEPARATOR).to_string();
    if name.is_empty() {
        return Err(EmptyNameError(joined));
    }
    Ok(name)
}

/// Generates a random lowercase alphanumeric suffix of the given length,
/// used when a request does not supply one.
pub fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_segments_pass_through() {
        assert_eq!(
            canonicalize(&["tenama", "infix", "suffix"]).unwrap(),
            "tenama-infix-suffix"
        );
    }

    #[test]
    fn test_invalid_characters_become_dashes() {
        assert_eq!(
            canonicalize(&["tenama", "My Team!", "abcde"]).unwrap(),
            "tenama-my-team--abcde"
        );
        assert_eq!(canonicalize(&["Feature/Branch"]).unwrap(), "feature-branch");
    }

    #[test]
    fn test_leading_and_trailing_dashes_stripped() {
        assert_eq!(canonicalize(&["--abc--"]).unwrap(), "abc");
        assert_eq!(canonicalize(&["!x!"]).unwrap(), "x");
    }

    #[test]
    fn test_truncates_to_63() {
        let long = "a".repeat(100);
        let name = canonicalize(&[&long]).unwrap();
        assert_eq!(name.len(), MAX_LABEL_LEN);
    }

    #[test]
    fn test_truncation_then_strip_keeps_valid_end() {
        // Character 63 lands on a dash, which must not survive as the tail.
        let input = format!("{}-{}", "a".repeat(62), "b".repeat(10));
        let name = canonicalize(&[&input]).unwrap();
        assert_eq!(name, "a".repeat(62));
    }

    #[test]
    fn test_empty_results_rejected() {
        assert!(canonicalize(&[""]).is_err());
        assert!(canonicalize(&["!!!"]).is_err());
        assert!(canonicalize(&["-", "-"]).is_err());
    }

    #[test]
    fn test_canonicalization_is_idempotent() {
        for input in ["tenama-My Team!-abcde", "--x--", "ABC_def.9", "a b c"] {
            let once = canonicalize(&[input]).unwrap();
            let twice = canonicalize(&[&once]).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_result_matches_label_grammar() {
        for input in ["My Team!", "x", "9-lives", "Ü_ber"] {
            let name = canonicalize(&["tenama", input, "abcde"]).unwrap();
            assert!(name.len() <= MAX_LABEL_LEN);
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
            assert!(!name.starts_with('-') && !name.ends_with('-'));
        }
    }

    #[test]
    fn test_random_suffix_shape() {
        let suffix = random_suffix(GENERATED_SUFFIX_LEN);
        assert_eq!(suffix.len(), GENERATED_SUFFIX_LEN);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
