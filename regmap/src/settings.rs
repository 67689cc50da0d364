//! Settings files: flat `name: 0xHH` text dumps of register and bit-field values

use std::{
    collections::HashMap,
    io::{self, Write},
    iter, path, slice,
};

use fs_err as fs;
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;

use crate::{error::SettingsError, model::RegisterMap, util};

lazy_static! {
    static ref SETTINGS_LINE: Regex = Regex::new(r"^(?P<name>[^\s:]+)\s*:\s*(?P<value>.*)$").unwrap();
}

/// Ordered mapping from register or bit-field name to value
///
/// Insertion order is kept so that applying the settings with
/// [`crate::RegisterMapAccessor::write_fields`] replays the writes in file order. Inserting a
/// name twice replaces the value where the name was first inserted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settings {
    entries: Vec<(String, u64)>,
    /// Position of each name in `entries`
    index: HashMap<String, usize>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: u64) {
        let name = name.into();
        match self.index.get(&name) {
            Some(&pos) => self.entries[pos].1 = value,
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push((name, value));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.index.get(name).map(|&pos| self.entries[pos].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> Iter<'_> {
        fn entry((name, value): &(String, u64)) -> (&str, u64) {
            (name.as_str(), *value)
        }
        self.entries.iter().map(entry as fn(&(String, u64)) -> (&str, u64))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Write one `name: 0xHH` line per entry
    ///
    /// Hex digits are upper-case and padded to at least two digits.
    ///
    /// # Errors
    ///
    /// Writing to `out` fails
    pub fn write_to(&self, mut out: impl io::Write) -> io::Result<()> {
        for (name, value) in self {
            writeln!(out, "{name}: 0x{value:02X}")?;
        }
        Ok(())
    }

    /// Parse a settings file, keeping only names known to `map`
    ///
    /// Unknown names are skipped with a warning before their value is looked at. Blank lines are
    /// ignored, as is whitespace around the colon. Values accept the prefixes `0x`, `0o`, `0b`,
    /// or none for decimal.
    ///
    /// # Errors
    ///
    /// - Reading from `input` fails
    /// - A line is not of the form `<name>: <value>`
    /// - The value of a known name is not a non-negative integer
    pub fn read_from(input: impl io::BufRead, map: &RegisterMap) -> Result<Self, SettingsError> {
        let mut settings = Self::new();
        for (idx, line) in input.lines().enumerate() {
            let line = line?;
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            let malformed = || SettingsError::MalformedLine {
                line: idx + 1,
                text: text.to_owned(),
            };
            let caps = SETTINGS_LINE.captures(text).ok_or_else(malformed)?;
            let name = &caps["name"];
            if !map.contains(name) {
                warn!("could not find register {name} in register map, skipping");
                continue;
            }
            let value = util::parse_nonneg_int(caps["value"].trim()).ok_or_else(malformed)?;
            settings.insert(name, value);
        }
        Ok(settings)
    }

    /// # Errors
    ///
    /// The file cannot be created or written
    pub fn save(&self, path: &path::Path) -> Result<(), SettingsError> {
        let mut out = io::BufWriter::new(fs::File::create(path)?);
        self.write_to(&mut out)?;
        out.flush()?;
        Ok(())
    }

    /// # Errors
    ///
    /// The file cannot be read, or see [`Self::read_from`]
    pub fn load(path: &path::Path, map: &RegisterMap) -> Result<Self, SettingsError> {
        let file = fs::File::open(path)?;
        Self::read_from(io::BufReader::new(file), map)
    }
}

pub type Iter<'a> = iter::Map<slice::Iter<'a, (String, u64)>, fn(&(String, u64)) -> (&str, u64)>;

impl<'a> IntoIterator for &'a Settings {
    type Item = (&'a str, u64);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for Settings {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        let mut settings = Self::new();
        for (name, value) in iter {
            settings.insert(name, value);
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::model::status_map;

    #[test]
    fn write_to_pads_and_uppercases() {
        let settings: Settings = [("STATUS", 0x28), ("CTRL", 0x5), ("threshold", 0xabc)]
            .into_iter()
            .collect();
        let mut out = Vec::new();
        settings.write_to(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            indoc! {"
                STATUS: 0x28
                CTRL: 0x05
                threshold: 0xABC
            "}
        );
    }

    #[test]
    fn read_from_skips_unknown_names() {
        let text = indoc! {"
            STATUS: 0x28

            NOT_A_REAL_NAME: 0x01
            busy: 1
            threshold: 0b101
        "};
        let settings = Settings::read_from(text.as_bytes(), &status_map()).unwrap();
        assert_eq!(
            settings.iter().collect::<Vec<_>>(),
            [("STATUS", 0x28), ("busy", 1), ("threshold", 5)]
        );
    }

    #[test]
    fn read_from_reports_malformed_lines() {
        let text = indoc! {"
            STATUS: 0x28
            CTRL=0x01
        "};
        let err = Settings::read_from(text.as_bytes(), &status_map()).unwrap_err();
        assert!(matches!(err, SettingsError::MalformedLine { line: 2, .. }));

        let err = Settings::read_from("GAIN: -3\n".as_bytes(), &status_map()).unwrap_err();
        assert!(matches!(err, SettingsError::MalformedLine { line: 1, .. }));
    }

    #[test]
    fn read_from_ignores_value_of_unknown_names() {
        let text = indoc! {"
            UNKNOWN_REG: n/a
            STATUS: 0x28
        "};
        let settings = Settings::read_from(text.as_bytes(), &status_map()).unwrap();
        assert_eq!(settings.iter().collect::<Vec<_>>(), [("STATUS", 0x28)]);
    }

    #[test]
    fn read_from_tolerates_extra_whitespace() {
        let text = "STATUS:  0x28\nCTRL :0x05 \n\tGAIN:\t7\n";
        let settings = Settings::read_from(text.as_bytes(), &status_map()).unwrap();
        assert_eq!(
            settings.iter().collect::<Vec<_>>(),
            [("STATUS", 0x28), ("CTRL", 5), ("GAIN", 7)]
        );
    }

    #[test]
    fn insert_keeps_first_position() {
        let mut settings = Settings::new();
        settings.insert("mode", 1);
        settings.insert("busy", 1);
        settings.insert("mode", 2);
        assert_eq!(settings.names().collect::<Vec<_>>(), ["mode", "busy"]);
        assert_eq!(settings.get("mode"), Some(2));
        assert_eq!(settings.len(), 2);
        assert_eq!(settings.get("busy"), Some(1));
        assert_eq!(settings.get("missing"), None);
    }
}
