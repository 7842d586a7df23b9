use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRole {
    Front,
    Back,
    Label,
    Measurement,
    Detail,
    Flaw,
}

/// A fetchable product photo. Accepts either a bare URL or `{url, role}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageRef {
    Url(String),
    Tagged {
        url: String,
        #[serde(default)]
        role: Option<ImageRole>,
    },
}

impl ImageRef {
    pub fn url(&self) -> &str {
        match self {
            ImageRef::Url(url) => url,
            ImageRef::Tagged { url, .. } => url,
        }
    }

    pub fn role(&self) -> Option<ImageRole> {
        match self {
            ImageRef::Url(_) => None,
            ImageRef::Tagged { role, .. } => *role,
        }
    }
}

impl From<&str> for ImageRef {
    fn from(value: &str) -> Self {
        ImageRef::Url(value.to_string())
    }
}

/// Hints from a chunked OCR pass: which image first showed each blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageHints {
    pub label_index: Option<usize>,
    pub measurement_index: Option<usize>,
}

/// Picks up to `cap` images for the main call: one label image, one
/// measurement image, then fills from the front in original order.
pub fn select_priority(images: &[ImageRef], cap: usize, hints: ImageHints) -> Vec<String> {
    if cap == 0 {
        return Vec::new();
    }
    let label = images
        .iter()
        .position(|image| image.role() == Some(ImageRole::Label))
        .or(hints.label_index);
    let measurement = images
        .iter()
        .position(|image| image.role() == Some(ImageRole::Measurement))
        .or(hints.measurement_index);

    let mut picked: Vec<usize> = Vec::with_capacity(cap);
    for idx in [label, measurement].into_iter().flatten() {
        if idx < images.len() && !picked.contains(&idx) && picked.len() < cap {
            picked.push(idx);
        }
    }
    for idx in 0..images.len() {
        if picked.len() >= cap {
            break;
        }
        if !picked.contains(&idx) {
            picked.push(idx);
        }
    }
    picked.sort_unstable();
    picked
        .into_iter()
        .map(|idx| images[idx].url().to_string())
        .collect()
}
