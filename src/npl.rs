// src/npl.rs

//! Now playing list documents, as served to devices and as read back from
//! receivers.

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Recording, SourceLocator, StreamKind};

pub const CONTAINER_NAMESPACE: &str = "http://www.tivo.com/developer/calypso-protocol-1.6/";
pub const MIME_TIVO_MPEG: &str = "video/x-tivo-mpeg";
pub const MIME_TIVO_MPEG_TS: &str = "video/x-tivo-mpeg-ts";
pub const MIME_VIDEO_CONTAINER: &str = "x-tivo-container/tivo-videos";
pub const MIME_FOLDER: &str = "x-tivo-container/folder";

#[derive(Debug, Error)]
pub enum NplError {
    #[error("malformed now playing list: {0}")]
    Xml(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename = "TiVoContainer")]
pub struct Container {
    #[serde(rename = "@xmlns", default, skip_serializing_if = "String::is_empty")]
    pub xmlns: String,
    #[serde(rename = "Details")]
    pub details: ContainerDetails,
    #[serde(rename = "ItemStart", default)]
    pub item_start: u32,
    #[serde(rename = "ItemCount", default)]
    pub item_count: u32,
    #[serde(rename = "Item", default)]
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerDetails {
    #[serde(rename = "Title", default)]
    pub title: String,
    #[serde(rename = "ContentType", default)]
    pub content_type: String,
    #[serde(rename = "SourceFormat", default)]
    pub source_format: String,
    #[serde(rename = "TotalItems", default)]
    pub total_items: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Item {
    #[serde(rename = "Details")]
    pub details: ItemDetails,
    #[serde(rename = "Links", default, skip_serializing_if = "Option::is_none")]
    pub links: Option<ItemLinks>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ItemDetails {
    #[serde(rename = "Title", default)]
    pub title: String,
    #[serde(rename = "ContentType", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(rename = "SourceFormat", default, skip_serializing_if = "Option::is_none")]
    pub source_format: Option<String>,
    #[serde(rename = "EpisodeTitle", default, skip_serializing_if = "Option::is_none")]
    pub episode_title: Option<String>,
    #[serde(rename = "EpisodeNumber", default, skip_serializing_if = "Option::is_none")]
    pub episode_number: Option<String>,
    #[serde(rename = "SourceSize", default, skip_serializing_if = "Option::is_none")]
    pub source_size: Option<String>,
    /// Seconds since the epoch, in hex (`0x...`).
    #[serde(rename = "CaptureDate", default, skip_serializing_if = "Option::is_none")]
    pub capture_date: Option<String>,
    #[serde(rename = "OriginalAirDate", default, skip_serializing_if = "Option::is_none")]
    pub original_air_date: Option<String>,
    #[serde(rename = "SourceChannel", default, skip_serializing_if = "Option::is_none")]
    pub source_channel: Option<String>,
    #[serde(rename = "SourceStation", default, skip_serializing_if = "Option::is_none")]
    pub source_station: Option<String>,
    #[serde(rename = "ProgramId", default, skip_serializing_if = "Option::is_none")]
    pub program_id: Option<String>,
    #[serde(rename = "MovieYear", default, skip_serializing_if = "Option::is_none")]
    pub movie_year: Option<String>,
    #[serde(rename = "TotalItems", default, skip_serializing_if = "Option::is_none")]
    pub total_items: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ItemLinks {
    #[serde(rename = "Content", default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Link>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Link {
    #[serde(rename = "Url")]
    pub url: String,
    #[serde(rename = "ContentType", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl Container {
    pub fn parse(xml: &str) -> Result<Self, NplError> {
        quick_xml::de::from_str(xml).map_err(|e| NplError::Xml(e.to_string()))
    }

    pub fn to_xml(&self) -> Result<String, NplError> {
        let body = quick_xml::se::to_string(self).map_err(|e| NplError::Xml(e.to_string()))?;
        Ok(format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n{body}"))
    }

    /// A page of `items` starting at `start`, out of `total`.
    pub fn page(title: &str, content_type: &str, items: Vec<Item>, start: u32, total: u32) -> Self {
        Self {
            xmlns: CONTAINER_NAMESPACE.to_string(),
            details: ContainerDetails {
                title: title.to_string(),
                content_type: content_type.to_string(),
                source_format: MIME_FOLDER.to_string(),
                total_items: total,
            },
            item_start: start,
            item_count: items.len() as u32,
            items,
        }
    }

    pub fn total_items(&self) -> u32 {
        self.details.total_items
    }

    /// Converts the listed video items into recordings pulled through `unit`.
    /// Relative content links are resolved against `base`.
    pub fn recordings(&self, unit: &str, base: &Url, stream_kind: StreamKind) -> Vec<Recording> {
        self.items
            .iter()
            .filter_map(|item| item.to_recording(unit, base, stream_kind))
            .collect()
    }
}

impl Item {
    fn to_recording(&self, unit: &str, base: &Url, stream_kind: StreamKind) -> Option<Recording> {
        let link = self.links.as_ref()?.content.as_ref()?;
        let url = base.join(&link.url).ok()?;
        let d = &self.details;
        let id = url
            .query_pairs()
            .find(|(k, _)| k == "id")
            .map(|(_, v)| v.into_owned())
            .or_else(|| d.program_id.clone())
            .unwrap_or_else(|| url.path().to_string());

        let mut rec = Recording::new(id, d.title.clone(), SourceLocator::Receiver {
            unit: unit.to_string(),
            url: url.to_string(),
        });
        rec.episode_title = d.episode_title.clone().filter(|t| !t.is_empty());
        if let Some((season, episode)) = d.episode_number.as_deref().and_then(split_episode_number) {
            rec.season = Some(season);
            rec.episode = Some(episode);
        }
        rec.date_recorded = d.capture_date.as_deref().and_then(parse_capture_date);
        rec.original_air_date = d
            .original_air_date
            .as_deref()
            .and_then(|s| NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d").ok());
        rec.callsign = d.source_station.clone();
        rec.channel = d.source_channel.clone();
        rec.movie_year = d.movie_year.as_deref().and_then(|y| y.trim().parse().ok());
        rec.size_bytes = d.source_size.as_deref().and_then(|s| s.trim().parse().ok());
        rec.stream_kind = stream_kind;
        Some(rec)
    }
}

/// `EpisodeNumber` packs the season into the hundreds: `203` is s02e03.
fn split_episode_number(value: &str) -> Option<(u32, u32)> {
    let n: u32 = value.trim().parse().ok()?;
    if n >= 100 {
        Some((n / 100, n % 100))
    } else {
        Some((0, n))
    }
}

fn parse_capture_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let secs = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => value.parse().ok()?,
    };
    DateTime::from_timestamp(secs, 0)
}
