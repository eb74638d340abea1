//! Derivation of destination identifiers from declared names.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::bail;
use crate::error::{ErrorKind, TndResult};

/// Column names the engine writes into every final and raw table.
pub const RAW_ID_COLUMN: &str = "_airbyte_raw_id";
pub const EXTRACTED_AT_COLUMN: &str = "_airbyte_extracted_at";
pub const LOADED_AT_COLUMN: &str = "_airbyte_loaded_at";
pub const DATA_COLUMN: &str = "_airbyte_data";
pub const META_COLUMN: &str = "_airbyte_meta";

/// Names no declared field may take verbatim.
pub const SYSTEM_COLUMNS: &[&str] = &[
    RAW_ID_COLUMN,
    EXTRACTED_AT_COLUMN,
    LOADED_AT_COLUMN,
    DATA_COLUMN,
    META_COLUMN,
];

/// Hex characters of the name hash appended on collision.
const SUFFIX_HASH_LEN: usize = 6;

/// Case folding the destination applies to unquoted identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierCase {
    Lower,
    Upper,
    Preserve,
}

/// Identifier constraints of one dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamingRules {
    pub max_length: usize,
    pub case: IdentifierCase,
    pub allow_leading_digit: bool,
}

impl NamingRules {
    /// Canonical identifier for `raw_name`, without collision handling.
    ///
    /// Fails with [`ErrorKind::InvalidIdentifier`] when nothing is left after trimming.
    pub fn resolve(&self, raw_name: &str) -> TndResult<String> {
        let trimmed = raw_name.trim();
        if trimmed.is_empty() {
            bail!(
                ErrorKind::InvalidIdentifier,
                "Identifier is empty",
                format!("`{raw_name}` has no legal representation")
            );
        }

        let mut name: String = trimmed
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();

        if !self.allow_leading_digit && name.starts_with(|c: char| c.is_ascii_digit()) {
            name.insert(0, '_');
        }

        let name = match self.case {
            IdentifierCase::Lower => name.to_ascii_lowercase(),
            IdentifierCase::Upper => name.to_ascii_uppercase(),
            IdentifierCase::Preserve => name,
        };

        Ok(truncate(&name, self.max_length).to_string())
    }

    /// Same as [`NamingRules::resolve`] with a short hash of `raw_name` appended.
    fn resolve_with_suffix(&self, raw_name: &str) -> TndResult<String> {
        let hash = self.hash_suffix(raw_name);
        let base = self.resolve(raw_name)?;
        let keep = self.max_length.saturating_sub(hash.len());

        Ok(format!("{}{hash}", truncate(&base, keep)))
    }

    /// `name` (already resolved) followed by `suffix`, shortened to fit `max_length`.
    ///
    /// A name that has to be cut keeps a hash of its full form before the suffix,
    /// so two long names sharing a prefix still get distinct results.
    pub fn with_suffix(&self, name: &str, suffix: &str) -> String {
        if name.len() + suffix.len() <= self.max_length {
            return format!("{name}{suffix}");
        }

        let hash = self.hash_suffix(name);
        let keep = self.max_length.saturating_sub(hash.len() + suffix.len());

        format!("{}{hash}{suffix}", truncate(name, keep))
    }

    /// `_` and the first hex characters of the SHA-256 of `raw_name`.
    fn hash_suffix(&self, raw_name: &str) -> String {
        let hash = Sha256::digest(raw_name.as_bytes());
        let hex: String = hash
            .iter()
            .flat_map(|byte| [byte >> 4, byte & 0x0f])
            .take(SUFFIX_HASH_LEN)
            .map(|nibble| char::from_digit(u32::from(nibble), 16).unwrap_or('0'))
            .collect();

        match self.case {
            IdentifierCase::Upper => format!("_{}", hex.to_ascii_uppercase()),
            _ => format!("_{hex}"),
        }
    }
}

/// Cuts `name` to at most `max_length` bytes. Identifiers are ASCII after resolution.
fn truncate(name: &str, max_length: usize) -> &str {
    if name.len() <= max_length {
        name
    } else {
        &name[..max_length]
    }
}

/// Identifiers already taken within one scope (a table's columns, or a destination's tables).
///
/// Collisions are detected case-insensitively.
#[derive(Debug, Clone)]
pub struct IdentifierSet {
    rules: NamingRules,
    taken: HashSet<String>,
}

impl IdentifierSet {
    pub fn new(rules: NamingRules) -> Self {
        Self {
            rules,
            taken: HashSet::new(),
        }
    }

    /// A column scope with the engine's system columns already taken.
    pub fn for_columns(rules: NamingRules) -> Self {
        let mut set = Self::new(rules);
        for column in SYSTEM_COLUMNS {
            set.taken.insert(column.to_ascii_lowercase());
        }
        set
    }

    /// Resolves `raw_name` and reserves the result.
    ///
    /// A name that collides after resolution gets a hash suffix; a collision that
    /// survives the suffix fails with [`ErrorKind::IdentifierCollision`].
    pub fn claim(&mut self, raw_name: &str) -> TndResult<String> {
        let resolved = self.rules.resolve(raw_name)?;
        if self.taken.insert(resolved.to_ascii_lowercase()) {
            return Ok(resolved);
        }

        let suffixed = self.rules.resolve_with_suffix(raw_name)?;
        if self.taken.insert(suffixed.to_ascii_lowercase()) {
            return Ok(suffixed);
        }

        bail!(
            ErrorKind::IdentifierCollision,
            "Identifier collides with another one",
            format!("`{raw_name}` resolves to `{resolved}` and `{suffixed}`, both already taken")
        )
    }

    /// Claims every name of `raw_names`, returning the results in the same order.
    ///
    /// Which of several colliding names keeps the plain identifier does not depend
    /// on their order: a name that is already its own resolution wins, then the
    /// smallest name by byte order.
    pub fn claim_all(&mut self, raw_names: &[&str]) -> Vec<TndResult<String>> {
        let mut order: Vec<usize> = (0..raw_names.len()).collect();
        order.sort_by_cached_key(|&index| {
            let raw_name = raw_names[index];
            let verbatim = self
                .rules
                .resolve(raw_name)
                .is_ok_and(|resolved| resolved == raw_name);
            (!verbatim, raw_name)
        });

        let mut claimed: Vec<Option<TndResult<String>>> = raw_names.iter().map(|_| None).collect();
        for index in order {
            claimed[index] = Some(self.claim(raw_names[index]));
        }

        claimed.into_iter().flatten().collect()
    }
}
