//! Built-in schemas for the health-data portal feeds.

use crate::schema::{FieldRule, HeaderPolicy, Schema, SchemaError};

pub const MASK: &str = "mask";
pub const PROVIDER: &str = "provider";
pub const HOURS: &str = "hours";
pub const DIRECTORY: &str = "directory";

pub const SCHEMA_NAMES: &[&str] = &[MASK, PROVIDER, HOURS, DIRECTORY];

/// Length of a weekly schedule: 7 weekdays x morning/afternoon/evening.
pub const SCHEDULE_FLAGS: usize = 21;

const PERIODS: [&str; 3] = ["上午", "下午", "晚上"];

/// Weekly schedule column. Accepts either the portal's `N`/`Y` slot string
/// (`N` = open) or one "weekday + period + open/closed" phrase per slot, e.g.
/// `星期一上午看診、星期一下午休診、...`, in any order. Anything that does not
/// fill exactly 21 flags is rejected.
pub fn weekly_schedule(name: &str) -> Result<FieldRule, SchemaError> {
    FieldRule::optional(name)
        .convert(schedule_flags)
        .pattern(&format!("^[01]{{{SCHEDULE_FLAGS}}}$"))
}

fn is_separator(c: char) -> bool {
    matches!(c, '、' | '，' | ',' | ';' | '；') || c.is_whitespace()
}

fn schedule_flags(value: &str) -> Option<String> {
    if !value.contains("星期") {
        return value
            .chars()
            .filter(|c| !is_separator(*c))
            .map(|c| match c {
                'N' | '1' => Some('1'),
                'Y' | '0' => Some('0'),
                _ => None,
            })
            .collect();
    }

    let mut slots = [None; SCHEDULE_FLAGS];
    for phrase in value.split(is_separator).filter(|p| !p.is_empty()) {
        let (slot, open) = schedule_phrase(phrase)?;
        if slots[slot].replace(open).is_some() {
            return None;
        }
    }
    slots
        .iter()
        .map(|slot| slot.map(|open| if open { '1' } else { '0' }))
        .collect()
}

/// `星期三晚上看診` -> (slot 8, open).
fn schedule_phrase(phrase: &str) -> Option<(usize, bool)> {
    let mut chars = phrase.strip_prefix("星期")?.chars();
    let day = match chars.next()? {
        '一' => 0,
        '二' => 1,
        '三' => 2,
        '四' => 3,
        '五' => 4,
        '六' => 5,
        '日' | '天' => 6,
        _ => return None,
    };
    let rest = chars.as_str();
    let (period, state) = PERIODS
        .iter()
        .enumerate()
        .find_map(|(i, p)| rest.strip_prefix(*p).map(|state| (i, state)))?;
    let open = match state {
        "看診" | "開診" => true,
        "休診" => false,
        _ => return None,
    };
    Some((day * PERIODS.len() + period, open))
}

fn notice(name: &str) -> FieldRule {
    FieldRule::optional(name).sentinel("-")
}

fn phone(name: &str) -> Result<FieldRule, SchemaError> {
    FieldRule::required(name).rewrite(r"\s", "")
}

/// NHI mask inventory (`maskdata.csv`).
pub fn mask_schema() -> Result<Schema, SchemaError> {
    let count = |name: &str| -> Result<FieldRule, SchemaError> {
        FieldRule::optional(name)
            .sentinel("-")
            .rewrite(r"^\s*0+([0-9])", "$1")?
            .pattern(r"^[0-9]+$")
    };
    Ok(Schema::new(
        MASK,
        HeaderPolicy::replace(&["id", "name", "address", "tel", "adult", "child", "mask_updated"]),
        vec![
            FieldRule::required("id").alphanumeric(),
            count("adult")?,
            count("child")?,
            FieldRule::optional("mask_updated"),
        ],
    ))
}

/// Contracted-provider directory, one feed per provider tier.
pub fn provider_schema() -> Result<Schema, SchemaError> {
    Ok(Schema::new(
        PROVIDER,
        HeaderPolicy::replace(&[
            "id", "name", "f3", "tel", "address", "f6", "type", "f8", "f9", "end", "time", "notice",
        ]),
        vec![
            FieldRule::required("id").alphanumeric(),
            FieldRule::required("name"),
            phone("tel")?,
            FieldRule::optional("address"),
            FieldRule::required("type"),
            FieldRule::drop_if_equal("end", ""),
            weekly_schedule("time")?,
            notice("notice"),
        ],
    ))
}

/// Fixed service hours of contracted clinics.
pub fn hours_schema() -> Result<Schema, SchemaError> {
    Ok(Schema::new(
        HOURS,
        HeaderPolicy::replace(&[
            "id", "name", "f3", "f4", "f5", "time", "notice", "opened", "updatedAt",
        ]),
        vec![
            FieldRule::required("id").alphanumeric(),
            FieldRule::required("name"),
            weekly_schedule("time")?,
            notice("notice"),
            FieldRule::drop_if_equal("opened", "0"),
        ],
    ))
}

/// The store directory as published from our own spreadsheet. Its header row
/// is trusted and every column besides the join key is republished as is.
pub fn directory_schema() -> Result<Schema, SchemaError> {
    Ok(Schema::new(
        DIRECTORY,
        HeaderPolicy::Source,
        vec![
            FieldRule::required("id").alphanumeric(),
            FieldRule::required("name"),
        ],
    )
    .passthrough_unknown())
}

pub fn schema_by_name(name: &str) -> Result<Schema, SchemaError> {
    match name {
        MASK => mask_schema(),
        PROVIDER => provider_schema(),
        HOURS => hours_schema(),
        DIRECTORY => directory_schema(),
        other => Err(SchemaError::Unknown(other.to_string())),
    }
}
