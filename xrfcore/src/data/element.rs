use std::collections::BTreeMap;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ElementError {
    #[error("element catalogue is empty")]
    Empty,
    #[error("duplicate element name: {0}")]
    Duplicate(String),
    #[error("invalid element name: {0:?}")]
    InvalidName(String),
    #[error("element {name}: {reason}")]
    InvalidValue { name: String, reason: String },
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("failed to read element catalogue: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse element catalogue json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Element symbol with an optional shell suffix, e.g. `Fe`, `Fe_K`, `Pb_L`, `Au_M`.
fn element_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Z][a-z]?(_[KLM])?$").expect("static regex is valid"))
}

/// One element to quantify: the centre of its emission line and the width of the ROI around it.
///
/// `center` is given in keV, `width` in eV.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementEntry {
    pub name: String,
    pub center: f64,
    pub width: f64,
}

impl ElementEntry {
    /// Constructs a validated `ElementEntry`.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use xrfcore::data::element::ElementEntry;
    /// let fe = ElementEntry::new("Fe_K", 6.404, 200.0).unwrap();
    /// assert_eq!(fe.name, "Fe_K");
    /// assert!(ElementEntry::new("iron", 6.404, 200.0).is_err());
    /// assert!(ElementEntry::new("Fe", 6.404, 0.0).is_err());
    /// ```
    pub fn new(name: &str, center: f64, width: f64) -> Result<Self, ElementError> {
        let entry = ElementEntry { name: name.to_string(), center, width };
        entry.validate()?;
        Ok(entry)
    }

    fn validate(&self) -> Result<(), ElementError> {
        if !element_name_pattern().is_match(&self.name) {
            return Err(ElementError::InvalidName(self.name.clone()));
        }
        if !self.center.is_finite() {
            return Err(ElementError::InvalidValue {
                name: self.name.clone(),
                reason: format!("center energy must be finite, got {}", self.center),
            });
        }
        if !(self.width.is_finite() && self.width > 0.0) {
            return Err(ElementError::InvalidValue {
                name: self.name.clone(),
                reason: format!("roi width must be positive, got {}", self.width),
            });
        }
        Ok(())
    }

    /// Lower edge of the ROI in keV.
    pub fn low_energy(&self) -> f64 {
        self.center - self.width / 2.0 / 1000.0
    }

    /// Upper edge of the ROI in keV.
    pub fn high_energy(&self) -> f64 {
        self.center + self.width / 2.0 / 1000.0
    }
}

impl Display for ElementEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} keV, {} eV)", self.name, self.center, self.width)
    }
}

/// The catalogue of elements to fit, keyed by unique element name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ElementEntry>", into = "Vec<ElementEntry>")]
pub struct ElementSpecification {
    elements: BTreeMap<String, ElementEntry>,
}

impl ElementSpecification {
    pub fn new(entries: Vec<ElementEntry>) -> Result<Self, ElementError> {
        if entries.is_empty() {
            return Err(ElementError::Empty);
        }
        let mut elements = BTreeMap::new();
        for entry in entries {
            entry.validate()?;
            if elements.contains_key(&entry.name) {
                return Err(ElementError::Duplicate(entry.name));
            }
            elements.insert(entry.name.clone(), entry);
        }
        Ok(ElementSpecification { elements })
    }

    /// Parses a whitespace separated catalogue, one `NAME CENTER_KEV WIDTH_EV` entry per line.
    ///
    /// Blank lines and lines starting with `#` are skipped.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use xrfcore::data::element::ElementSpecification;
    /// let text = "# name keV eV\nCa 3.692 160\nFe_K 6.404 200\n";
    /// let elements = ElementSpecification::parse(text).unwrap();
    /// assert_eq!(elements.len(), 2);
    /// assert_eq!(elements.get("Fe_K").unwrap().center, 6.404);
    /// ```
    pub fn parse(text: &str) -> Result<Self, ElementError> {
        let mut entries = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 3 {
                return Err(ElementError::Parse {
                    line: idx + 1,
                    reason: format!("expected 3 fields, found {}", fields.len()),
                });
            }
            let number = |field: &str| -> Result<f64, ElementError> {
                field.parse::<f64>().map_err(|e| ElementError::Parse {
                    line: idx + 1,
                    reason: format!("{field:?}: {e}"),
                })
            };
            entries.push(ElementEntry::new(fields[0], number(fields[1])?, number(fields[2])?)?);
        }
        Self::new(entries)
    }

    /// Loads a catalogue from disk. Files ending in `.json` are read as a list of entries,
    /// anything else as the line format accepted by [`ElementSpecification::parse`].
    pub fn from_file(path: &Path) -> Result<Self, ElementError> {
        let text = fs::read_to_string(path)?;
        let elements = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            _ => Self::parse(&text)?,
        };
        debug!("Loaded element catalogue from {}: {}", path.display(), elements);
        Ok(elements)
    }

    /// Common K lines for a quick-look map.
    pub fn default_k_lines() -> Self {
        let entries = [
            ("Ar", 2.957, 150.0),
            ("Ca", 3.692, 160.0),
            ("Ti", 4.511, 170.0),
            ("Cr", 5.415, 180.0),
            ("Mn", 5.899, 190.0),
            ("Fe", 6.404, 200.0),
            ("Ni", 7.478, 210.0),
            ("Cu", 8.048, 220.0),
            ("Zn", 8.639, 230.0),
        ];
        ElementSpecification {
            elements: entries
                .iter()
                .map(|(name, center, width)| {
                    (name.to_string(), ElementEntry { name: name.to_string(), center: *center, width: *width })
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ElementEntry> {
        self.elements.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.elements.keys().map(|name| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ElementEntry> {
        self.elements.values()
    }
}

impl TryFrom<Vec<ElementEntry>> for ElementSpecification {
    type Error = ElementError;

    fn try_from(entries: Vec<ElementEntry>) -> Result<Self, Self::Error> {
        ElementSpecification::new(entries)
    }
}

impl From<ElementSpecification> for Vec<ElementEntry> {
    fn from(spec: ElementSpecification) -> Self {
        spec.elements.into_values().collect()
    }
}

impl Display for ElementSpecification {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ElementSpecification[{}]", self.names().join(", "))
    }
}
