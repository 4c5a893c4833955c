// src/naming.rs

use std::fmt::Write as _;

use chrono::format::{Item, StrftimeItems};
use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;

use crate::models::Recording;

pub const DEFAULT_MOVIE_TEMPLATE: &str = "{title} ({movie_year})";
pub const DEFAULT_EPISODE_TEMPLATE: &str =
    "{title} - s{season:d}e{episode:02d} - {episode_title} ({date_recorded},{callsign})";

const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";
/// Width used by `season`/`episode` when the format gives none.
const DEFAULT_COUNTER_WIDTH: usize = 2;

/// Characters that cannot appear in a file name, and what replaces them.
const FILENAME_REPLACEMENTS: &[(char, &str)] = &[
    ('\\', "-"),
    ('/', "-"),
    (':', " -"),
    (';', ","),
    ('*', "."),
    ('?', "."),
    ('!', "."),
    ('"', "'"),
    ('<', "("),
    ('>', ")"),
    ('|', " "),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown template field '{0}'")]
    UnknownField(String),
    #[error("template syntax error at byte {position}: {message}")]
    Syntax { position: usize, message: &'static str },
    #[error("invalid format '{format}' for field '{field}'")]
    BadFormat { field: String, format: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Season,
    Episode,
    EpisodeTitle,
    DateRecorded,
    Callsign,
    Channel,
    MovieYear,
    OriginalAirDate,
    StreamKind,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "title" => Field::Title,
            "season" => Field::Season,
            "episode" => Field::Episode,
            "episode_title" => Field::EpisodeTitle,
            "date_recorded" => Field::DateRecorded,
            "callsign" => Field::Callsign,
            "channel" => Field::Channel,
            "movie_year" => Field::MovieYear,
            "original_air_date" => Field::OriginalAirDate,
            "stream_kind" => Field::StreamKind,
            _ => return None,
        })
    }

    fn is_date(self) -> bool {
        matches!(self, Field::DateRecorded | Field::OriginalAirDate)
    }

    fn is_number(self) -> bool {
        matches!(self, Field::Season | Field::Episode | Field::MovieYear)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldFormat {
    Plain,
    Number { width: Option<usize>, zero_pad: bool },
    Date(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field { field: Field, format: FieldFormat },
}

/// A parsed naming template: literal text with `{field}` or
/// `{field:format}` substitutions. `{{` and `}}` stand for braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((pos, ch)) = chars.next() {
            match ch {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '}' => {
                    return Err(TemplateError::Syntax { position: pos, message: "unmatched '}'" });
                }
                '{' => {
                    let mut body = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        body.push(c);
                    }
                    if !closed {
                        return Err(TemplateError::Syntax { position: pos, message: "unclosed '{'" });
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(parse_placeholder(&body, pos)?);
                }
                _ => literal.push(ch),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }

    /// Renders the template. Absent text renders empty, absent counters as
    /// zero, and an absent air date as 1900-01-01.
    pub fn render(&self, recording: &Recording) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field { field, format } => render_field(&mut out, *field, format, recording),
            }
        }
        out
    }
}

fn parse_placeholder(body: &str, position: usize) -> Result<Segment, TemplateError> {
    let (name, spec) = match body.split_once(':') {
        Some((name, spec)) => (name.trim(), Some(spec)),
        None => (body.trim(), None),
    };
    if name.is_empty() {
        return Err(TemplateError::Syntax { position, message: "empty field name" });
    }
    let field = Field::parse(name).ok_or_else(|| TemplateError::UnknownField(name.to_string()))?;
    let bad_format = || TemplateError::BadFormat {
        field: name.to_string(),
        format: spec.unwrap_or_default().to_string(),
    };

    let format = match spec {
        None => FieldFormat::Plain,
        Some(spec) if field.is_date() => {
            let valid = !spec.is_empty()
                && StrftimeItems::new(spec).all(|item| !matches!(item, Item::Error));
            if !valid {
                return Err(bad_format());
            }
            FieldFormat::Date(spec.to_string())
        }
        Some(spec) if field.is_number() => parse_number_format(spec).ok_or_else(bad_format)?,
        Some(_) => return Err(bad_format()),
    };
    Ok(Segment::Field { field, format })
}

/// Accepts `d`, `Nd` and `0Nd`.
fn parse_number_format(spec: &str) -> Option<FieldFormat> {
    let digits = spec.strip_suffix('d')?;
    if digits.is_empty() {
        return Some(FieldFormat::Number { width: None, zero_pad: false });
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let zero_pad = digits.starts_with('0');
    let width = digits.parse().ok()?;
    Some(FieldFormat::Number { width: Some(width), zero_pad })
}

fn render_field(out: &mut String, field: Field, format: &FieldFormat, rec: &Recording) {
    match field {
        Field::Title => out.push_str(&rec.title),
        Field::EpisodeTitle => out.push_str(rec.episode_title.as_deref().unwrap_or_default()),
        Field::Callsign => out.push_str(rec.callsign.as_deref().unwrap_or_default()),
        Field::Channel => out.push_str(rec.channel.as_deref().unwrap_or_default()),
        Field::StreamKind => out.push_str(rec.stream_kind.as_str()),
        Field::Season => render_counter(out, rec.season.unwrap_or(0), format),
        Field::Episode => render_counter(out, rec.episode.unwrap_or(0), format),
        Field::MovieYear => {
            if let Some(year) = rec.movie_year {
                render_number(out, u64::from(year), format, None);
            }
        }
        Field::DateRecorded => {
            if let Some(recorded) = rec.date_recorded {
                render_date(out, recorded.naive_utc(), format);
            }
        }
        Field::OriginalAirDate => {
            let aired = rec.original_air_date.unwrap_or(unknown_air_date());
            if let Some(midnight) = aired.and_hms_opt(0, 0, 0) {
                render_date(out, midnight, format);
            }
        }
    }
}

fn unknown_air_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1900, 1, 1).unwrap_or(NaiveDate::MIN)
}

fn render_counter(out: &mut String, value: u32, format: &FieldFormat) {
    render_number(out, u64::from(value), format, Some(DEFAULT_COUNTER_WIDTH));
}

fn render_number(out: &mut String, value: u64, format: &FieldFormat, default_width: Option<usize>) {
    let (width, zero_pad) = match format {
        FieldFormat::Number { width: Some(width), zero_pad } => (*width, *zero_pad),
        _ => (default_width.unwrap_or(0), true),
    };
    let _ = if zero_pad {
        write!(out, "{value:0width$}")
    } else {
        write!(out, "{value:width$}")
    };
}

fn render_date(out: &mut String, value: NaiveDateTime, format: &FieldFormat) {
    let pattern = match format {
        FieldFormat::Date(pattern) => pattern.as_str(),
        _ => DEFAULT_DATE_FORMAT,
    };
    let mut rendered = String::new();
    if write!(rendered, "{}", value.format(pattern)).is_err() {
        rendered.clear();
        let _ = write!(rendered, "{}", value.format(DEFAULT_DATE_FORMAT));
    }
    out.push_str(&rendered);
}

/// Replaces characters that are not allowed in file names.
pub fn sanitize_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match FILENAME_REPLACEMENTS.iter().find(|(bad, _)| *bad == ch) {
            Some((_, replacement)) => out.push_str(replacement),
            None if ch.is_control() => {}
            None => out.push(ch),
        }
    }
    out.trim().to_string()
}

/// Separator debris left where a template field rendered empty, and its
/// replacement. Applied until nothing changes.
const EMPTY_FIELD_DEBRIS: &[(&str, &str)] = &[
    (" -  (", " ("),
    ("(,", "("),
    (",)", ")"),
    (",,", ","),
    ("()", ""),
    (" - - ", " - "),
    ("  ", " "),
];

/// Drops the separators around fields that rendered empty, so
/// `Show - s01e02 -  (2021-02-22,)` becomes `Show - s01e02 (2021-02-22)`.
pub fn tidy_separators(name: &str) -> String {
    let mut out = name.to_string();
    loop {
        let before = out.len();
        for (debris, replacement) in EMPTY_FIELD_DEBRIS {
            out = out.replace(debris, replacement);
        }
        if out.len() == before {
            break;
        }
    }
    out.trim()
        .trim_end_matches(" -")
        .trim_start_matches("- ")
        .trim()
        .to_string()
}

/// Turns recording metadata into a file name stem.
#[derive(Debug, Clone)]
pub struct NamingResolver {
    movie: Template,
    episode: Template,
}

impl NamingResolver {
    /// Parses both templates; an unknown field or bad format is reported
    /// here, before any transfer uses the resolver.
    pub fn new(movie: &str, episode: &str) -> Result<Self, TemplateError> {
        Ok(Self {
            movie: Template::parse(movie)?,
            episode: Template::parse(episode)?,
        })
    }

    /// Sanitized name without extension. Recordings with a movie year use
    /// the movie template, everything else the episode template.
    pub fn resolve(&self, recording: &Recording) -> String {
        let template = if recording.is_movie() { &self.movie } else { &self.episode };
        let name = tidy_separators(&sanitize_file_name(&template.render(recording)));
        if name.is_empty() {
            sanitize_file_name(&recording.id)
        } else {
            name
        }
    }

    pub fn file_name(&self, recording: &Recording, extension: &str) -> String {
        format!("{}.{}", self.resolve(recording), extension)
    }
}

impl Default for NamingResolver {
    fn default() -> Self {
        Self {
            movie: Template::parse(DEFAULT_MOVIE_TEMPLATE).unwrap_or(Template { segments: Vec::new() }),
            episode: Template::parse(DEFAULT_EPISODE_TEMPLATE).unwrap_or(Template { segments: Vec::new() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceLocator;
    use chrono::{TimeZone, Utc};

    fn show() -> Recording {
        let mut rec = Recording::new("1001", "Show", SourceLocator::Local { path: "/v/show.ts".into() });
        rec.episode_title = Some("Pilot".into());
        rec.season = Some(0);
        rec.episode = Some(0);
        rec.callsign = Some("ABC".into());
        rec.date_recorded = Some(Utc.with_ymd_and_hms(2021, 2, 22, 20, 30, 0).unwrap());
        rec
    }

    #[test]
    fn episode_template_renders_documented_example() {
        let resolver = NamingResolver::new(DEFAULT_MOVIE_TEMPLATE, DEFAULT_EPISODE_TEMPLATE).unwrap();
        assert_eq!(resolver.resolve(&show()), "Show - s00e00 - Pilot (2021-02-22,ABC)");
    }

    #[test]
    fn movie_year_selects_movie_template() {
        let resolver = NamingResolver::new("{title} ({movie_year})", "{title} episode").unwrap();
        let mut rec = show();
        assert_eq!(resolver.resolve(&rec), "Show episode");
        rec.movie_year = Some(1999);
        assert_eq!(resolver.resolve(&rec), "Show (1999)");
    }

    #[test]
    fn unknown_field_is_rejected_at_construction() {
        let err = NamingResolver::new("{title}", "{title} {network}").unwrap_err();
        assert_eq!(err, TemplateError::UnknownField("network".into()));
    }

    #[test]
    fn malformed_templates_are_rejected() {
        assert!(matches!(Template::parse("{title"), Err(TemplateError::Syntax { .. })));
        assert!(matches!(Template::parse("title}"), Err(TemplateError::Syntax { .. })));
        assert!(matches!(Template::parse("{title:02d}"), Err(TemplateError::BadFormat { .. })));
        assert!(matches!(Template::parse("{season:x}"), Err(TemplateError::BadFormat { .. })));
        assert!(matches!(Template::parse("{date_recorded:%Q}"), Err(TemplateError::BadFormat { .. })));
    }

    #[test]
    fn missing_fields_have_defined_renderings() {
        let rec = Recording::new("7", "Bare", SourceLocator::Local { path: "/v/b.ts".into() });
        let template =
            Template::parse("{title}|{episode_title}|{season}|{episode:3d}|{original_air_date}|{date_recorded}").unwrap();
        assert_eq!(template.render(&rec), "Bare||00|  0|1900-01-01|");
    }

    #[test]
    fn date_sub_format_and_escaped_braces() {
        let template = Template::parse("{{{title}}} {date_recorded:%b %d, %Y}").unwrap();
        assert_eq!(template.render(&show()), "{Show} Feb 22, 2021");
    }

    #[test]
    fn resolved_names_are_file_safe() {
        let resolver = NamingResolver::new("{title}", "{title}: {episode_title}").unwrap();
        let mut rec = show();
        rec.title = "What/When?".into();
        assert_eq!(resolver.resolve(&rec), "What-When. - Pilot");
        assert_eq!(resolver.file_name(&rec, "ts"), "What-When. - Pilot.ts");
    }

    #[test]
    fn empty_fields_leave_no_stray_separators() {
        let resolver = NamingResolver::default();
        let mut rec = show();
        rec.episode_title = None;
        rec.callsign = None;
        assert_eq!(resolver.resolve(&rec), "Show - s00e00 (2021-02-22)");

        rec.date_recorded = None;
        assert_eq!(resolver.resolve(&rec), "Show - s00e00");

        rec.episode_title = Some("Pilot".into());
        rec.callsign = Some("ABC".into());
        assert_eq!(resolver.resolve(&rec), "Show - s00e00 - Pilot (ABC)");
    }

    #[test]
    fn tidying_keeps_filled_names_intact() {
        assert_eq!(tidy_separators("Show - s00e00 - Pilot (2021-02-22,ABC)"), "Show - s00e00 - Pilot (2021-02-22,ABC)");
        assert_eq!(tidy_separators("A  -  B"), "A - B");
        assert_eq!(tidy_separators("Title -"), "Title");
    }

    #[test]
    fn resolution_is_idempotent() {
        let resolver = NamingResolver::default();
        let rec = show();
        assert_eq!(resolver.resolve(&rec), resolver.resolve(&rec));
    }
}
