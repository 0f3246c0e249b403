use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::jsonc;

/// Errors raised while loading or querying the label map registry.
#[derive(thiserror::Error, Debug)]
pub enum LabelError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Label space '{0}' is missing from the label map file.")]
    MissingSpace(&'static str),
    #[error("Label id '{0}' in the label map file is not an 8-bit integer.")]
    BadLabelId(String),
    #[error("Name '{0}' is not defined in the '{1}' label space.")]
    UnknownName(String, &'static str),
}

pub type Result<T> = std::result::Result<T, LabelError>;

/// External segmenter task a canonical ROI expands to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegTask {
    Body,
    Total,
    HeadGlandsCavities,
}

impl SegTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegTask::Body => "body",
            SegTask::Total => "total",
            SegTask::HeadGlandsCavities => "head_glands_cavities",
        }
    }
}

impl fmt::Display for SegTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical ROI names recognized by the pipeline.
///
/// The set is closed: a requested ROI outside this set is rejected before
/// any segmentation work starts. `SyntheticLesion` is never requestable by
/// the user; it enters the effective ROI subset only after lesion insertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TdtRoi {
    Body,
    Kidney,
    Liver,
    Prostate,
    Spleen,
    Heart,
    SalivaryGlands,
    SyntheticLesion,
}

impl TdtRoi {
    /// ROIs a user may list in the configured subset.
    pub const REQUESTABLE: [TdtRoi; 7] = [
        TdtRoi::Body,
        TdtRoi::Kidney,
        TdtRoi::Liver,
        TdtRoi::Prostate,
        TdtRoi::Spleen,
        TdtRoi::Heart,
        TdtRoi::SalivaryGlands,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TdtRoi::Body => "body",
            TdtRoi::Kidney => "kidney",
            TdtRoi::Liver => "liver",
            TdtRoi::Prostate => "prostate",
            TdtRoi::Spleen => "spleen",
            TdtRoi::Heart => "heart",
            TdtRoi::SalivaryGlands => "salivary_glands",
            TdtRoi::SyntheticLesion => "synthetic_lesion",
        }
    }

    pub fn from_name(name: &str) -> Option<TdtRoi> {
        match name {
            "body" => Some(TdtRoi::Body),
            "kidney" => Some(TdtRoi::Kidney),
            "liver" => Some(TdtRoi::Liver),
            "prostate" => Some(TdtRoi::Prostate),
            "spleen" => Some(TdtRoi::Spleen),
            "heart" => Some(TdtRoi::Heart),
            "salivary_glands" => Some(TdtRoi::SalivaryGlands),
            "synthetic_lesion" => Some(TdtRoi::SyntheticLesion),
            _ => None,
        }
    }

    /// The external segmenter task that produces this ROI.
    ///
    /// `SyntheticLesion` is generated inside the pipeline and has no task.
    pub fn task(&self) -> Option<SegTask> {
        match self {
            TdtRoi::Body => Some(SegTask::Body),
            TdtRoi::Kidney
            | TdtRoi::Liver
            | TdtRoi::Prostate
            | TdtRoi::Spleen
            | TdtRoi::Heart => Some(SegTask::Total),
            TdtRoi::SalivaryGlands => Some(SegTask::HeadGlandsCavities),
            TdtRoi::SyntheticLesion => None,
        }
    }

    /// Names of the external segmenter classes this ROI expands to.
    pub fn expanded_names(&self) -> &'static [&'static str] {
        match self {
            TdtRoi::Body => &[],
            TdtRoi::Kidney => &["kidney_left", "kidney_right"],
            TdtRoi::Liver => &["liver"],
            TdtRoi::Prostate => &["prostate"],
            TdtRoi::Spleen => &["spleen"],
            TdtRoi::Heart => &["heart"],
            TdtRoi::SalivaryGlands => &[
                "parotid_gland_left",
                "parotid_gland_right",
                "submandibular_gland_left",
                "submandibular_gland_right",
            ],
            TdtRoi::SyntheticLesion => &[],
        }
    }

    /// The physiological compartment (VOI) this ROI draws its activity from.
    ///
    /// ROIs without an explicit mapping fall back to the `Rest` compartment
    /// at the PBPK stage.
    pub fn voi_name(&self) -> Option<&'static str> {
        match self {
            TdtRoi::Body => Some("Rest"),
            TdtRoi::Kidney => Some("Kidney"),
            TdtRoi::Liver => Some("Liver"),
            TdtRoi::Prostate => Some("Prostate"),
            TdtRoi::Spleen => Some("Spleen"),
            TdtRoi::Heart => Some("Heart"),
            TdtRoi::SalivaryGlands => Some("SG"),
            TdtRoi::SyntheticLesion => None,
        }
    }

    pub fn requestable_names() -> Vec<&'static str> {
        Self::REQUESTABLE.iter().map(|r| r.name()).collect()
    }
}

impl fmt::Display for TdtRoi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Registry translating between the three label spaces used by the pipeline:
/// the external segmenter's `total` and `head_glands_cavities` spaces and
/// the canonical `TDT_Pipeline` space.
///
/// The backing JSON file declares each space as an `id -> name` map; the
/// registry holds the reverse `name -> id` lookups.
#[derive(Clone, Debug)]
pub struct LabelMapRegistry {
    total: BTreeMap<String, u8>,
    head_glands_cavities: BTreeMap<String, u8>,
    tdt: BTreeMap<String, u8>,
}

impl LabelMapRegistry {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let stripped = jsonc::strip_json_comments(text);
        let spaces: BTreeMap<String, BTreeMap<String, String>> =
            serde_json::from_str(&stripped)?;

        let invert = |space: &'static str| -> Result<BTreeMap<String, u8>> {
            let map = spaces.get(space).ok_or(LabelError::MissingSpace(space))?;
            let mut out = BTreeMap::new();
            for (id, name) in map {
                let id = id
                    .parse::<u8>()
                    .map_err(|_| LabelError::BadLabelId(id.clone()))?;
                out.insert(name.clone(), id);
            }
            Ok(out)
        };

        Ok(Self {
            total: invert("total")?,
            head_glands_cavities: invert("head_glands_cavities")?,
            tdt: invert("TDT_Pipeline")?,
        })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Label id of an external class in the `total` space.
    pub fn total_id(&self, name: &str) -> Result<u8> {
        self.total
            .get(name)
            .copied()
            .ok_or_else(|| LabelError::UnknownName(name.to_string(), "total"))
    }

    /// Label id of an external class in the `head_glands_cavities` space.
    pub fn head_id(&self, name: &str) -> Result<u8> {
        self.head_glands_cavities
            .get(name)
            .copied()
            .ok_or_else(|| LabelError::UnknownName(name.to_string(), "head_glands_cavities"))
    }

    /// Canonical label id of a TDT ROI.
    pub fn tdt_id(&self, roi: TdtRoi) -> Result<u8> {
        self.tdt_id_by_name(roi.name())
    }

    pub fn tdt_id_by_name(&self, name: &str) -> Result<u8> {
        self.tdt
            .get(name)
            .copied()
            .ok_or_else(|| LabelError::UnknownName(name.to_string(), "TDT_Pipeline"))
    }

    /// Reverse lookup: canonical ROI carried by a TDT label id.
    pub fn tdt_roi_for_id(&self, id: u8) -> Option<TdtRoi> {
        self.tdt
            .iter()
            .find(|(_, v)| **v == id)
            .and_then(|(name, _)| TdtRoi::from_name(name))
    }
}
