//! Booking data and page extraction
//!
//! The current booking is read with an ordered list of strategies, each
//! returning a tagged [`Extraction`]; the first hit wins.

use std::sync::OnceLock;

use chrono::{Datelike, NaiveDate, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::{ElementHandle, PageDriver};
use crate::error::{Error, FailureReason, Result};
use crate::pacer::Pacer;

/// CSS selectors describing the booking site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageSelectors {
    /// Link back to the booking overview, present on every other view
    pub booking_view: String,
    pub booking_date: String,
    pub booking_time: String,
    pub booking_centre: String,
    pub change_booking: String,
    pub availability_marker: String,
    /// Attribute of a marker holding its date (falls back to the marker text)
    pub marker_date_attr: String,
    /// Attribute of a marker naming its centre
    pub marker_centre_attr: String,
    pub time_option: String,
    /// Attribute of a time option holding its time (falls back to the text)
    pub time_attr: String,
    pub continue_button: String,
    pub confirm_button: String,
    pub success_indicator: String,
}

impl Default for PageSelectors {
    fn default() -> Self {
        Self {
            booking_view: "#view-booking, a[href*='manage-booking']".into(),
            booking_date: "#booking-date, [data-booking-date]".into(),
            booking_time: "#booking-time, [data-booking-time]".into(),
            booking_centre: "#booking-centre, [data-booking-centre]".into(),
            change_booking: "#change-booking, a[href*='change-date']".into(),
            availability_marker: "td.slot-available[data-date], [data-available-date]".into(),
            marker_date_attr: "data-date".into(),
            marker_centre_attr: "data-centre".into(),
            time_option: "[data-slot-time], .slot-time".into(),
            time_attr: "data-slot-time".into(),
            continue_button: "#slot-continue, button[data-action='continue']".into(),
            confirm_button: "#confirm-booking, button[data-action='confirm']".into(),
            success_indicator: "#booking-confirmed, .confirmation-reference".into(),
        }
    }
}

/// Inclusive date window; open ends are unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |f| date >= f) && self.to.map_or(true, |t| date <= t)
    }
}

/// Extraction strategy that produced the booking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStrategy {
    /// Dedicated booking elements
    Selectors,
    /// Date/time patterns over the page text
    TextPattern,
}

/// Snapshot of the booking the user currently holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentBooking {
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    pub centre_id: Option<String>,
    pub source: BookingStrategy,
}

/// An offered slot earlier than the current booking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSlot {
    date: NaiveDate,
    times: Vec<NaiveTime>,
    centre_id: Option<String>,
    lead_time_delta: i32,
}

impl CandidateSlot {
    /// Slot for `date` if it is strictly earlier than the current booking
    pub fn earlier_than(
        current: &CurrentBooking,
        date: NaiveDate,
        times: Vec<NaiveTime>,
        centre_id: Option<String>,
    ) -> Option<Self> {
        (date < current.date).then(|| Self {
            date,
            times,
            centre_id,
            lead_time_delta: month_index(current.date) - month_index(date),
        })
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn times(&self) -> &[NaiveTime] {
        &self.times
    }

    pub fn centre_id(&self) -> Option<&str> {
        self.centre_id.as_deref()
    }

    /// Calendar months gained versus the current booking
    pub fn lead_time_delta(&self) -> i32 {
        self.lead_time_delta
    }
}

fn month_index(date: NaiveDate) -> i32 {
    date.year() * 12 + date.month0() as i32
}

/// Result of one extraction strategy
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction<T> {
    Found(T),
    Missing(String),
}

const MONTHS: &str = "jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?";

fn long_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?i)\b(\d{{1,2}})(?:st|nd|rd|th)?\s+({MONTHS})\.?,?\s+(\d{{4}})\b"
        ))
        .expect("valid long date regex")
    })
}

fn numeric_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:(\d{4})-(\d{2})-(\d{2})|(\d{1,2})/(\d{1,2})/(\d{4}))\b")
            .expect("valid numeric date regex")
    })
}

fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d{1,2})[:.](\d{2})(?:\s*([ap])\.?m\b\.?)?")
            .expect("valid time regex")
    })
}

fn centre_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^\s*(?:test\s+)?cent(?:re|er)\s*:?\s*(.+?)\s*$")
            .expect("valid centre regex")
    })
}

fn month_number(name: &str) -> Option<u32> {
    let m = match name.get(..3)?.to_ascii_lowercase().as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(m)
}

/// First date in `text`, with its byte offset
fn find_date(text: &str) -> Option<(usize, NaiveDate)> {
    let long = long_date_re().captures_iter(text).find_map(|c| {
        let day: u32 = c[1].parse().ok()?;
        let month = month_number(&c[2])?;
        let year: i32 = c[3].parse().ok()?;
        Some((c.get(0)?.start(), NaiveDate::from_ymd_opt(year, month, day)?))
    });
    let numeric = numeric_date_re().captures_iter(text).find_map(|c| {
        let (y, m, d) = if let Some(y) = c.get(1) {
            (y.as_str(), &c[2], &c[3])
        } else {
            (c.get(6)?.as_str(), &c[5], &c[4])
        };
        let date = NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)?;
        Some((c.get(0)?.start(), date))
    });

    match (long, numeric) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// First time in `text`, with its byte offset
fn find_time(text: &str) -> Option<(usize, NaiveTime)> {
    time_re().captures_iter(text).find_map(|c| {
        let mut hour: u32 = c[1].parse().ok()?;
        let minute: u32 = c[2].parse().ok()?;
        if let Some(meridiem) = c.get(3) {
            if !(1..=12).contains(&hour) {
                return None;
            }
            let pm = meridiem.as_str().eq_ignore_ascii_case("p");
            hour = match (hour, pm) {
                (12, false) => 0,
                (12, true) => 12,
                (h, true) => h + 12,
                (h, false) => h,
            };
        }
        Some((c.get(0)?.start(), NaiveTime::from_hms_opt(hour, minute, 0)?))
    })
}

/// Parse a date written as ISO, `dd/mm/yyyy` or long form ("Sat 1st March 2025")
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    find_date(text.trim()).map(|(_, d)| d)
}

/// Parse a string that is exactly one time ("8:10am", "14:30")
pub fn parse_time(text: &str) -> Option<NaiveTime> {
    let trimmed = text.trim();
    let m = time_re().find(trimmed)?;
    if m.start() != 0 || !trimmed[m.end()..].trim().is_empty() {
        return None;
    }
    find_time(trimmed).map(|(_, t)| t)
}

impl BookingStrategy {
    /// Default order: dedicated elements first, page text as fallback
    pub const DEFAULT_ORDER: [BookingStrategy; 2] =
        [BookingStrategy::Selectors, BookingStrategy::TextPattern];

    pub async fn extract<D>(
        &self,
        driver: &D,
        pacer: &Pacer,
        selectors: &PageSelectors,
    ) -> Result<Extraction<CurrentBooking>>
    where
        D: PageDriver + ?Sized,
    {
        match self {
            BookingStrategy::Selectors => extract_by_selectors(driver, pacer, selectors).await,
            BookingStrategy::TextPattern => extract_by_text(driver, pacer).await,
        }
    }
}

async fn text_of<D>(driver: &D, pacer: &Pacer, selector: &str) -> Result<Option<String>>
where
    D: PageDriver + ?Sized,
{
    match pacer.guard(driver.query(selector)).await? {
        Some(el) => Ok(Some(pacer.guard(driver.read_text(el)).await?)),
        None => Ok(None),
    }
}

async fn extract_by_selectors<D>(
    driver: &D,
    pacer: &Pacer,
    selectors: &PageSelectors,
) -> Result<Extraction<CurrentBooking>>
where
    D: PageDriver + ?Sized,
{
    let Some(date_text) = text_of(driver, pacer, &selectors.booking_date).await? else {
        return Ok(Extraction::Missing("no booking date element".into()));
    };
    let Some(date) = parse_date(&date_text) else {
        return Ok(Extraction::Missing(format!(
            "unparseable booking date '{date_text}'"
        )));
    };

    let time = text_of(driver, pacer, &selectors.booking_time)
        .await?
        .and_then(|t| find_time(&t).map(|(_, t)| t))
        // Some sites render date and time in one element
        .or_else(|| find_time(&date_text).map(|(_, t)| t));
    let centre_id = text_of(driver, pacer, &selectors.booking_centre)
        .await?
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());

    Ok(Extraction::Found(CurrentBooking {
        date,
        time,
        centre_id,
        source: BookingStrategy::Selectors,
    }))
}

async fn extract_by_text<D>(driver: &D, pacer: &Pacer) -> Result<Extraction<CurrentBooking>>
where
    D: PageDriver + ?Sized,
{
    let text = pacer.guard(driver.page_text()).await?;
    let Some((offset, date)) = find_date(&text) else {
        return Ok(Extraction::Missing("no date pattern in page text".into()));
    };
    // Prefer a time written after the date, as in "1 March 2025 at 8:10am"
    let time = find_time(&text[offset..])
        .or_else(|| find_time(&text))
        .map(|(_, t)| t);
    let centre_id = centre_re()
        .captures(&text)
        .map(|c| c[1].to_string())
        .filter(|c| !c.is_empty());

    Ok(Extraction::Found(CurrentBooking {
        date,
        time,
        centre_id,
        source: BookingStrategy::TextPattern,
    }))
}

/// Try each strategy in order; `booking_not_found` when none succeeds
pub async fn read_booking<D>(
    driver: &D,
    pacer: &Pacer,
    selectors: &PageSelectors,
    strategies: &[BookingStrategy],
) -> Result<CurrentBooking>
where
    D: PageDriver + ?Sized,
{
    let mut misses = Vec::new();
    for strategy in strategies {
        match strategy.extract(driver, pacer, selectors).await? {
            Extraction::Found(booking) => {
                debug!(strategy = ?strategy, date = %booking.date, "Current booking read");
                return Ok(booking);
            }
            Extraction::Missing(why) => {
                debug!(strategy = ?strategy, reason = %why, "Booking extraction missed");
                misses.push(format!("{strategy:?}: {why}"));
            }
        }
    }
    Err(Error::step_with(
        FailureReason::BookingNotFound,
        misses.join("; "),
    ))
}

/// Date advertised by an availability marker
pub(crate) async fn marker_date<D>(
    driver: &D,
    pacer: &Pacer,
    selectors: &PageSelectors,
    marker: ElementHandle,
) -> Result<Option<NaiveDate>>
where
    D: PageDriver + ?Sized,
{
    if let Some(raw) = pacer
        .guard(driver.attribute(marker, &selectors.marker_date_attr))
        .await?
    {
        if let Some(date) = parse_date(&raw) {
            return Ok(Some(date));
        }
    }
    let text = pacer.guard(driver.read_text(marker)).await?;
    Ok(parse_date(&text))
}

/// Time offered by a time option, if it is a valid time string
pub(crate) async fn option_time<D>(
    driver: &D,
    pacer: &Pacer,
    selectors: &PageSelectors,
    option: ElementHandle,
) -> Result<Option<NaiveTime>>
where
    D: PageDriver + ?Sized,
{
    let raw = match pacer
        .guard(driver.attribute(option, &selectors.time_attr))
        .await?
    {
        Some(raw) => raw,
        None => pacer.guard(driver.read_text(option)).await?,
    };
    Ok(parse_time(&raw))
}
