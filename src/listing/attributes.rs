use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{DefaultOnNull, serde_as};

/// Text-valued attributes of a garment record.
///
/// `price` and the three tag lists are typed separately on
/// [`ProductAttributes`]; everything else is a trimmed string or unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Brand,
    GarmentType,
    Department,
    Era,
    Condition,
    Flaws,
    ColourMain,
    ColourSecondary,
    Pattern,
    Material,
    MadeIn,
    Fit,
    SizeLabel,
    SizeRecommended,
    PitToPit,
    Style,
    Title,
    DescriptionStyleA,
    DescriptionStyleB,
}

impl Field {
    pub const ALL: [Field; 19] = [
        Field::Brand,
        Field::GarmentType,
        Field::Department,
        Field::Era,
        Field::Condition,
        Field::Flaws,
        Field::ColourMain,
        Field::ColourSecondary,
        Field::Pattern,
        Field::Material,
        Field::MadeIn,
        Field::Fit,
        Field::SizeLabel,
        Field::SizeRecommended,
        Field::PitToPit,
        Field::Style,
        Field::Title,
        Field::DescriptionStyleA,
        Field::DescriptionStyleB,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Field::Brand => "brand",
            Field::GarmentType => "garment_type",
            Field::Department => "department",
            Field::Era => "era",
            Field::Condition => "condition",
            Field::Flaws => "flaws",
            Field::ColourMain => "colour_main",
            Field::ColourSecondary => "colour_secondary",
            Field::Pattern => "pattern",
            Field::Material => "material",
            Field::MadeIn => "made_in",
            Field::Fit => "fit",
            Field::SizeLabel => "size_label",
            Field::SizeRecommended => "size_recommended",
            Field::PitToPit => "pit_to_pit",
            Field::Style => "style",
            Field::Title => "title",
            Field::DescriptionStyleA => "description_style_a",
            Field::DescriptionStyleB => "description_style_b",
        }
    }

    /// Human label used in prompt context blocks.
    pub fn label(self) -> &'static str {
        match self {
            Field::Brand => "Brand",
            Field::GarmentType => "Garment type",
            Field::Department => "Department",
            Field::Era => "Era",
            Field::Condition => "Condition",
            Field::Flaws => "Flaws",
            Field::ColourMain => "Main colour",
            Field::ColourSecondary => "Secondary colour",
            Field::Pattern => "Pattern",
            Field::Material => "Material",
            Field::MadeIn => "Made in",
            Field::Fit => "Fit",
            Field::SizeLabel => "Label size",
            Field::SizeRecommended => "Recommended size",
            Field::PitToPit => "Pit to pit",
            Field::Style => "Style",
            Field::Title => "Title",
            Field::DescriptionStyleA => "Description (style A)",
            Field::DescriptionStyleB => "Description (style B)",
        }
    }

    /// Marketplace copy the model authors rather than observes.
    pub fn is_copy(self) -> bool {
        matches!(
            self,
            Field::Title | Field::DescriptionStyleA | Field::DescriptionStyleB
        )
    }

    pub fn is_description(self) -> bool {
        matches!(self, Field::DescriptionStyleA | Field::DescriptionStyleB)
    }
}

/// Raw transcription blobs; diagnostic only, never structured fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrText {
    pub label_text: Option<String>,
    pub measurement_text: Option<String>,
}

impl OcrText {
    pub fn is_empty(&self) -> bool {
        self.label_text.is_none() && self.measurement_text.is_none()
    }

    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Object(obj)) => Self::from_object(obj),
            _ => Self::default(),
        }
    }

    /// Reads the two blobs off an object; "not visible" counts as absent.
    pub fn from_object(obj: &RawObject) -> Self {
        Self {
            label_text: blob_from(obj.get("label_text")),
            measurement_text: blob_from(obj.get("measurement_text")),
        }
    }
}

fn blob_from(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .and_then(crate::listing::sanitize::sanitize_value)
        .filter(|text| !crate::listing::ocr::is_not_visible(text))
}

/// The canonical garment record. Every key is always serialized; unset
/// fields serialize as `null`.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductAttributes {
    pub brand: Option<String>,
    pub garment_type: Option<String>,
    pub department: Option<String>,
    pub era: Option<String>,
    pub condition: Option<String>,
    pub flaws: Option<String>,
    pub colour_main: Option<String>,
    pub colour_secondary: Option<String>,
    pub pattern: Option<String>,
    pub material: Option<String>,
    pub made_in: Option<String>,
    pub fit: Option<String>,
    pub size_label: Option<String>,
    pub size_recommended: Option<String>,
    pub pit_to_pit: Option<String>,
    pub price: Option<f64>,
    pub title: Option<String>,
    pub description_style_a: Option<String>,
    pub description_style_b: Option<String>,
    pub shopify_tags: Option<Vec<String>>,
    pub etsy_tags: Option<Vec<String>>,
    pub collections_tags: Option<Vec<String>>,
    pub style: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    pub ocr_text: OcrText,
}

impl ProductAttributes {
    pub fn get(&self, field: Field) -> Option<&str> {
        self.slot(field).as_deref()
    }

    pub fn set(&mut self, field: Field, value: Option<String>) {
        *self.slot_mut(field) = value;
    }

    pub fn is_set(&self, field: Field) -> bool {
        self.get(field).is_some_and(|value| !value.trim().is_empty())
    }

    pub fn tags(&self, kind: TagKind) -> Option<&Vec<String>> {
        match kind {
            TagKind::Shopify => self.shopify_tags.as_ref(),
            TagKind::Etsy => self.etsy_tags.as_ref(),
            TagKind::Collections => self.collections_tags.as_ref(),
        }
    }

    pub fn set_tags(&mut self, kind: TagKind, tags: Option<Vec<String>>) {
        let slot = match kind {
            TagKind::Shopify => &mut self.shopify_tags,
            TagKind::Etsy => &mut self.etsy_tags,
            TagKind::Collections => &mut self.collections_tags,
        };
        *slot = tags.filter(|list| !list.is_empty());
    }

    /// Fields the caller has a usable value for, in schema order.
    pub fn set_fields(&self) -> impl Iterator<Item = (Field, &str)> {
        Field::ALL
            .into_iter()
            .filter_map(|field| self.get(field).map(|value| (field, value)))
            .filter(|(_, value)| !value.trim().is_empty())
    }

    pub fn has_any_value(&self) -> bool {
        self.set_fields().next().is_some()
            || self.price.is_some()
            || TagKind::ALL.iter().any(|kind| self.tags(*kind).is_some())
    }

    fn slot(&self, field: Field) -> &Option<String> {
        match field {
            Field::Brand => &self.brand,
            Field::GarmentType => &self.garment_type,
            Field::Department => &self.department,
            Field::Era => &self.era,
            Field::Condition => &self.condition,
            Field::Flaws => &self.flaws,
            Field::ColourMain => &self.colour_main,
            Field::ColourSecondary => &self.colour_secondary,
            Field::Pattern => &self.pattern,
            Field::Material => &self.material,
            Field::MadeIn => &self.made_in,
            Field::Fit => &self.fit,
            Field::SizeLabel => &self.size_label,
            Field::SizeRecommended => &self.size_recommended,
            Field::PitToPit => &self.pit_to_pit,
            Field::Style => &self.style,
            Field::Title => &self.title,
            Field::DescriptionStyleA => &self.description_style_a,
            Field::DescriptionStyleB => &self.description_style_b,
        }
    }

    fn slot_mut(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::Brand => &mut self.brand,
            Field::GarmentType => &mut self.garment_type,
            Field::Department => &mut self.department,
            Field::Era => &mut self.era,
            Field::Condition => &mut self.condition,
            Field::Flaws => &mut self.flaws,
            Field::ColourMain => &mut self.colour_main,
            Field::ColourSecondary => &mut self.colour_secondary,
            Field::Pattern => &mut self.pattern,
            Field::Material => &mut self.material,
            Field::MadeIn => &mut self.made_in,
            Field::Fit => &mut self.fit,
            Field::SizeLabel => &mut self.size_label,
            Field::SizeRecommended => &mut self.size_recommended,
            Field::PitToPit => &mut self.pit_to_pit,
            Field::Style => &mut self.style,
            Field::Title => &mut self.title,
            Field::DescriptionStyleA => &mut self.description_style_a,
            Field::DescriptionStyleB => &mut self.description_style_b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    Shopify,
    Etsy,
    Collections,
}

impl TagKind {
    pub const ALL: [TagKind; 3] = [TagKind::Shopify, TagKind::Etsy, TagKind::Collections];

    pub fn key(self) -> &'static str {
        match self {
            TagKind::Shopify => "shopify_tags",
            TagKind::Etsy => "etsy_tags",
            TagKind::Collections => "collections_tags",
        }
    }
}

/// Reads a model-supplied scalar as text. Numbers are rendered without a
/// trailing `.0`; anything structured is ignored.
pub fn text_from_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(format_number(number.as_f64()?)),
        Value::Bool(_) | Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Accepts `45`, `"45.00"`, `"$45"` and `"USD 45"`.
pub fn price_from_value(value: Option<&Value>) -> Option<f64> {
    let price = match value? {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => {
            let cleaned: String = text
                .chars()
                .filter(|ch| ch.is_ascii_digit() || *ch == '.')
                .collect();
            cleaned.parse::<f64>().ok()?
        }
        _ => return None,
    };
    price.is_finite().then_some(price)
}

/// Tags arrive either as a JSON array or a comma separated string.
pub fn tags_from_value(value: Option<&Value>) -> Option<Vec<String>> {
    let raw: Vec<String> = match value? {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        Value::String(text) => text.split(',').map(str::to_string).collect(),
        _ => return None,
    };
    crate::listing::sanitize::sanitize_tags(raw)
}

pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        let rendered = format!("{value:.2}");
        rendered.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Object view of a repaired model response.
pub type RawObject = Map<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unset_fields_serialize_as_null() {
        let attrs = ProductAttributes {
            brand: Some("Levi's".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(&attrs).expect("serialize");
        assert_eq!(value["brand"], json!("Levi's"));
        assert!(value.get("title").is_some());
        assert!(value["title"].is_null());
        assert!(value["shopify_tags"].is_null());
        assert!(value["ocr_text"]["label_text"].is_null());
    }

    #[test]
    fn field_accessors_cover_every_key() {
        let mut attrs = ProductAttributes::default();
        for field in Field::ALL {
            attrs.set(field, Some(field.key().to_string()));
        }
        let value = serde_json::to_value(&attrs).expect("serialize");
        for field in Field::ALL {
            assert_eq!(value[field.key()], json!(field.key()));
        }
    }

    #[test]
    fn price_parses_loose_strings() {
        assert_eq!(price_from_value(Some(&json!("$45.50"))), Some(45.5));
        assert_eq!(price_from_value(Some(&json!(30))), Some(30.0));
        assert_eq!(price_from_value(Some(&json!("free"))), None);
    }

    #[test]
    fn tags_accept_string_or_array_and_dedupe() {
        assert_eq!(
            tags_from_value(Some(&json!("vintage, 90s, Vintage, null"))),
            Some(vec!["vintage".to_string(), "90s".to_string()])
        );
        assert_eq!(
            tags_from_value(Some(&json!(["denim", "", "N/A"]))),
            Some(vec!["denim".to_string()])
        );
        assert_eq!(tags_from_value(Some(&json!([]))), None);
    }

    #[test]
    fn numbers_render_without_trailing_zeroes() {
        assert_eq!(format_number(24.0), "24");
        assert_eq!(format_number(24.5), "24.5");
        assert_eq!(text_from_value(Some(&json!(21))), Some("21".to_string()));
    }

    #[test]
    fn database_rows_with_null_ocr_text_deserialize() {
        let attrs: ProductAttributes =
            serde_json::from_value(json!({"brand": "Wrangler", "ocr_text": null})).expect("row");
        assert_eq!(attrs.brand.as_deref(), Some("Wrangler"));
        assert!(attrs.ocr_text.is_empty());
    }

    #[test]
    fn label_blob_mentioning_an_unreadable_tag_is_kept() {
        let obj = json!({
            "label_text": "Levi's size M (care tag not visible)",
            "measurement_text": "not visible"
        });
        let text = OcrText::from_value(Some(&obj));
        assert_eq!(
            text.label_text.as_deref(),
            Some("Levi's size M (care tag not visible)")
        );
        assert_eq!(text.measurement_text, None);
    }
}
