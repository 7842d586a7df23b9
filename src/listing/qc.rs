//! Confidence scoring for unattended runs. Pure, no I/O.

use crate::listing::attributes::{Field, ProductAttributes};
use crate::listing::sanitize::split_note;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const READY_THRESHOLD: u8 = 85;
pub const REVIEW_THRESHOLD: u8 = 60;
pub const PRICE_BAND: (f64, f64) = (5.0, 1000.0);

const REQUIRED: [Field; 4] = [
    Field::Title,
    Field::DescriptionStyleA,
    Field::GarmentType,
    Field::Condition,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QcFlag {
    MissingRequiredFields,
    MissingSize,
    MissingMeasurements,
    EraUncertain,
    BrandUnclear,
    DamagePresentNotDescribed,
    MissingPrice,
    PriceOutOfBand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QcStatus {
    Ready,
    NeedsReview,
    Blocked,
}

impl QcStatus {
    /// A missing required field blocks regardless of the score.
    pub fn decide(confidence: u8, flags: &BTreeSet<QcFlag>, required_missing: bool) -> Self {
        if required_missing {
            QcStatus::Blocked
        } else if confidence >= READY_THRESHOLD && flags.is_empty() {
            QcStatus::Ready
        } else if confidence >= REVIEW_THRESHOLD {
            QcStatus::NeedsReview
        } else {
            QcStatus::Blocked
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QcReport {
    pub status: QcStatus,
    pub confidence: u8,
    pub flags: BTreeSet<QcFlag>,
}

pub fn score(product: &ProductAttributes) -> QcReport {
    let mut confidence: i32 = 100;
    let mut flags = BTreeSet::new();
    let mut deduct = |points: i32, flag: QcFlag| {
        confidence -= points;
        flags.insert(flag);
    };

    let missing_required = REQUIRED
        .iter()
        .filter(|field| !product.is_set(**field))
        .count();
    for _ in 0..missing_required {
        deduct(15, QcFlag::MissingRequiredFields);
    }
    if !product.is_set(Field::SizeLabel) && !product.is_set(Field::SizeRecommended) {
        deduct(20, QcFlag::MissingSize);
    }
    if !product.is_set(Field::PitToPit) {
        deduct(10, QcFlag::MissingMeasurements);
    }
    if !product.is_set(Field::Era) {
        deduct(5, QcFlag::EraUncertain);
    }
    if !product.is_set(Field::Brand) {
        deduct(10, QcFlag::BrandUnclear);
    }
    if shows_wear(product.condition.as_deref()) && !product.is_set(Field::Flaws) {
        deduct(10, QcFlag::DamagePresentNotDescribed);
    }
    match product.price {
        Some(price) if price > 0.0 => {
            if price < PRICE_BAND.0 || price > PRICE_BAND.1 {
                deduct(5, QcFlag::PriceOutOfBand);
            }
        }
        _ => deduct(20, QcFlag::MissingPrice),
    }

    let confidence = confidence.clamp(0, 100) as u8;
    QcReport {
        status: QcStatus::decide(confidence, &flags, missing_required > 0),
        confidence,
        flags,
    }
}

fn shows_wear(condition: Option<&str>) -> bool {
    let Some(condition) = condition else {
        return false;
    };
    let (grade, _) = split_note(condition);
    grade.eq_ignore_ascii_case("fair") || grade.eq_ignore_ascii_case("good")
}
