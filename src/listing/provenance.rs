//! Field-level source resolution.
//!
//! Every place that has to choose between competing values for the same
//! attribute (listing generation, title size resolution, autopilot merge)
//! goes through [`resolve`], so there is exactly one priority order.

use crate::listing::attributes::Field;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Read off the garment label or measurement sign.
    Ocr,
    /// Already on the product record.
    Caller,
    /// Inferred by the model from photos and context.
    Model,
    /// Regex pass over the raw transcription.
    RegexFallback,
}

/// Highest priority first.
pub const PRIORITY: [Source; 4] = [
    Source::Ocr,
    Source::Caller,
    Source::Model,
    Source::RegexFallback,
];

/// Which raw transcription backs a field, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    LabelText,
    MeasurementText,
}

pub fn backing(field: Field) -> Option<Backing> {
    match field {
        Field::Brand | Field::Material | Field::MadeIn | Field::SizeLabel => {
            Some(Backing::LabelText)
        }
        Field::PitToPit => Some(Backing::MeasurementText),
        _ => None,
    }
}

/// Competing values for one field.
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    pub ocr: Option<String>,
    pub caller: Option<String>,
    pub model: Option<String>,
    pub regex: Option<String>,
}

impl Candidates {
    fn get(&self, source: Source) -> Option<&str> {
        let value = match source {
            Source::Ocr => self.ocr.as_deref(),
            Source::Caller => self.caller.as_deref(),
            Source::Model => self.model.as_deref(),
            Source::RegexFallback => self.regex.as_deref(),
        };
        value.filter(|text| !text.trim().is_empty())
    }

    /// Places a model value in the OCR slot when the transcription that
    /// backs the field was actually present.
    pub fn with_model_value(
        mut self,
        field: Field,
        value: Option<String>,
        label: bool,
        measurement: bool,
    ) -> Self {
        let ocr_backed = match backing(field) {
            Some(Backing::LabelText) => label,
            Some(Backing::MeasurementText) => measurement,
            None => false,
        };
        if ocr_backed {
            self.ocr = value;
        } else {
            self.model = value;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub value: String,
    pub source: Source,
}

pub fn resolve(candidates: &Candidates) -> Option<Resolved> {
    PRIORITY.iter().find_map(|source| {
        candidates.get(*source).map(|value| Resolved {
            value: value.to_string(),
            source: *source,
        })
    })
}

pub fn resolve_value(candidates: &Candidates) -> Option<String> {
    resolve(candidates).map(|resolved| resolved.value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ocr_beats_caller_beats_model_beats_regex() {
        let all = Candidates {
            ocr: Some("ocr".into()),
            caller: Some("caller".into()),
            model: Some("model".into()),
            regex: Some("regex".into()),
        };
        assert_eq!(resolve(&all).map(|r| r.source), Some(Source::Ocr));

        let no_ocr = Candidates { ocr: None, ..all.clone() };
        assert_eq!(resolve_value(&no_ocr).as_deref(), Some("caller"));

        let only_tail = Candidates {
            caller: Some("   ".into()),
            regex: Some("regex".into()),
            ..Default::default()
        };
        assert_eq!(resolve(&only_tail).map(|r| r.source), Some(Source::RegexFallback));
    }

    #[test]
    fn label_backed_model_value_counts_as_ocr_only_with_label_text() {
        let with_label = Candidates::default().with_model_value(
            Field::SizeLabel,
            Some("M".into()),
            true,
            false,
        );
        assert_eq!(with_label.ocr.as_deref(), Some("M"));

        let without_label = Candidates::default().with_model_value(
            Field::SizeLabel,
            Some("M".into()),
            false,
            true,
        );
        assert_eq!(without_label.model.as_deref(), Some("M"));

        let unbacked =
            Candidates::default().with_model_value(Field::Era, Some("90s".into()), true, true);
        assert_eq!(unbacked.model.as_deref(), Some("90s"));
    }
}
