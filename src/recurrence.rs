//! Recurrence rules and their expansion into calendar dates.
//!
//! The model is a subset of RFC 5545 rules: a start date, one or more inclusion
//! rules, optional exclusion rules, explicit extra dates and explicit exception
//! dates. Expansion is a pure function of the recurrence and the horizon.

use std::collections::{BTreeSet, VecDeque};
use std::iter::Peekable;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset, Weekday};

use crate::error::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleEnd {
    #[default]
    Never,
    /// Inclusive.
    Until { date: Date },
    /// Counted from the recurrence start, not from the horizon.
    Count { count: u32 },
}

fn one() -> u32 {
    1
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub frequency: Frequency,
    #[serde(default = "one")]
    pub interval: u32,
    #[serde(default)]
    pub by_weekday: Vec<Weekday>,
    /// 1..=31, or -31..=-1 counted back from the end of the month.
    #[serde(default)]
    pub by_month_day: Vec<i8>,
    /// 1..=12
    #[serde(default)]
    pub by_month: Vec<u8>,
    #[serde(default)]
    pub end: RuleEnd,
}

impl Rule {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            interval: 1,
            by_weekday: Vec::new(),
            by_month_day: Vec::new(),
            by_month: Vec::new(),
            end: RuleEnd::Never,
        }
    }

    pub fn every(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    pub fn on_weekdays(mut self, days: impl IntoIterator<Item = Weekday>) -> Self {
        self.by_weekday = days.into_iter().collect();
        self
    }

    pub fn on_month_days(mut self, days: impl IntoIterator<Item = i8>) -> Self {
        self.by_month_day = days.into_iter().collect();
        self
    }

    pub fn in_months(mut self, months: impl IntoIterator<Item = u8>) -> Self {
        self.by_month = months.into_iter().collect();
        self
    }

    pub fn until(mut self, date: Date) -> Self {
        self.end = RuleEnd::Until { date };
        self
    }

    pub fn count(mut self, count: u32) -> Self {
        self.end = RuleEnd::Count { count };
        self
    }

    fn validate(&self, dtstart: Date) -> Result<()> {
        if self.interval == 0 {
            return Err(Error::InvalidRecurrence("interval must be at least 1".into()));
        }
        if let Some(d) = self
            .by_month_day
            .iter()
            .find(|d| **d == 0 || !(-31..=31).contains(*d))
        {
            return Err(Error::InvalidRecurrence(format!("month day {d} out of range")));
        }
        if let Some(m) = self.by_month.iter().find(|m| !(1..=12).contains(*m)) {
            return Err(Error::InvalidRecurrence(format!("month {m} out of range")));
        }
        if let RuleEnd::Until { date } = self.end {
            if date < dtstart {
                return Err(Error::InvalidRecurrence(format!(
                    "until {date} is before start {dtstart}"
                )));
            }
        }
        Ok(())
    }

    fn month_allowed(&self, month: Month) -> bool {
        self.by_month.is_empty() || self.by_month.contains(&u8::from(month))
    }

    fn weekday_allowed(&self, date: Date) -> bool {
        self.by_weekday.is_empty() || self.by_weekday.contains(&date.weekday())
    }

    fn month_day_allowed(&self, date: Date) -> bool {
        if self.by_month_day.is_empty() {
            return true;
        }
        let len = date.month().length(date.year());
        self.by_month_day
            .iter()
            .any(|d| resolve_month_day(*d, len) == Some(date.day()))
    }

    /// Candidate dates of one month, in order.
    fn month_dates(&self, year: i32, month: Month, dtstart: Date) -> Vec<Date> {
        let len = month.length(year);
        let days: BTreeSet<u8> = if !self.by_month_day.is_empty() {
            self.by_month_day
                .iter()
                .filter_map(|d| resolve_month_day(*d, len))
                .collect()
        } else if !self.by_weekday.is_empty() {
            (1..=len).collect()
        } else if dtstart.day() <= len {
            BTreeSet::from([dtstart.day()])
        } else {
            BTreeSet::new()
        };

        days.into_iter()
            .filter_map(|day| Date::from_calendar_date(year, month, day).ok())
            .filter(|date| self.weekday_allowed(*date))
            .collect()
    }

    fn period_start(&self, dtstart: Date, index: u64) -> Option<Date> {
        let step = index.checked_mul(self.interval as u64)?;
        match self.frequency {
            Frequency::Daily => dtstart.checked_add(Duration::days(i64::try_from(step).ok()?)),
            Frequency::Weekly => {
                let monday = dtstart
                    .checked_sub(Duration::days(dtstart.weekday().number_days_from_monday() as i64))?;
                monday.checked_add(Duration::weeks(i64::try_from(step).ok()?))
            }
            Frequency::Monthly => {
                let months = dtstart.year() as i64 * 12
                    + (u8::from(dtstart.month()) as i64 - 1)
                    + i64::try_from(step).ok()?;
                let year = i32::try_from(months.div_euclid(12)).ok()?;
                let month = Month::try_from((months.rem_euclid(12) + 1) as u8).ok()?;
                Date::from_calendar_date(year, month, 1).ok()
            }
            Frequency::Yearly => {
                let year = i32::try_from(dtstart.year() as i64 + i64::try_from(step).ok()?).ok()?;
                Date::from_calendar_date(year, Month::January, 1).ok()
            }
        }
    }

    fn period_dates(&self, start: Date, dtstart: Date) -> Vec<Date> {
        match self.frequency {
            Frequency::Daily => {
                if self.month_allowed(start.month())
                    && self.month_day_allowed(start)
                    && self.weekday_allowed(start)
                {
                    vec![start]
                } else {
                    Vec::new()
                }
            }
            Frequency::Weekly => {
                let weekdays: BTreeSet<u8> = if self.by_weekday.is_empty() {
                    BTreeSet::from([dtstart.weekday().number_days_from_monday()])
                } else {
                    self.by_weekday
                        .iter()
                        .map(|w| w.number_days_from_monday())
                        .collect()
                };
                weekdays
                    .into_iter()
                    .filter_map(|offset| start.checked_add(Duration::days(offset as i64)))
                    .filter(|d| self.month_allowed(d.month()))
                    .collect()
            }
            Frequency::Monthly => {
                if !self.month_allowed(start.month()) {
                    return Vec::new();
                }
                self.month_dates(start.year(), start.month(), dtstart)
            }
            Frequency::Yearly => {
                let months: Vec<u8> = if !self.by_month.is_empty() {
                    let set: BTreeSet<u8> = self.by_month.iter().copied().collect();
                    set.into_iter().collect()
                } else if !self.by_month_day.is_empty() || !self.by_weekday.is_empty() {
                    (1..=12).collect()
                } else {
                    vec![u8::from(dtstart.month())]
                };
                months
                    .into_iter()
                    .filter_map(|m| Month::try_from(m).ok())
                    .flat_map(|m| self.month_dates(start.year(), m, dtstart))
                    .collect()
            }
        }
    }

    /// A period index whose period starts no later than `from`. Only used when
    /// the rule is not count-bounded, since counting must begin at dtstart.
    fn first_period_near(&self, dtstart: Date, from: Date) -> u64 {
        if from <= dtstart || matches!(self.end, RuleEnd::Count { .. }) {
            return 0;
        }
        let interval = self.interval.max(1) as i64;
        let elapsed = match self.frequency {
            Frequency::Daily => (from - dtstart).whole_days(),
            Frequency::Weekly => (from - dtstart).whole_weeks(),
            Frequency::Monthly => {
                (from.year() as i64 - dtstart.year() as i64) * 12
                    + (u8::from(from.month()) as i64 - u8::from(dtstart.month()) as i64)
            }
            Frequency::Yearly => from.year() as i64 - dtstart.year() as i64,
        };
        (elapsed / interval - 1).max(0) as u64
    }

    fn dates(&self, dtstart: Date, from: Date, stop: Date) -> RuleDates<'_> {
        RuleDates {
            rule: self,
            dtstart,
            stop,
            period: self.first_period_near(dtstart, from),
            buffer: VecDeque::new(),
            emitted: 0,
            done: false,
        }
    }
}

fn resolve_month_day(day: i8, len: u8) -> Option<u8> {
    match day {
        1..=31 if day as u8 <= len => Some(day as u8),
        -31..=-1 => {
            let from_end = len as i16 + 1 + day as i16;
            (from_end >= 1).then_some(from_end as u8)
        }
        _ => None,
    }
}

/// Ascending dates produced by one rule, stopping before `stop`.
struct RuleDates<'a> {
    rule: &'a Rule,
    dtstart: Date,
    stop: Date,
    period: u64,
    buffer: VecDeque<Date>,
    emitted: u32,
    done: bool,
}

impl Iterator for RuleDates<'_> {
    type Item = Date;

    fn next(&mut self) -> Option<Date> {
        loop {
            if let Some(date) = self.buffer.pop_front() {
                if date < self.dtstart {
                    continue;
                }
                match self.rule.end {
                    RuleEnd::Until { date: until } if date > until => {
                        self.done = true;
                        self.buffer.clear();
                        return None;
                    }
                    RuleEnd::Count { count } if self.emitted >= count => {
                        self.done = true;
                        self.buffer.clear();
                        return None;
                    }
                    _ => {}
                }
                self.emitted += 1;
                return Some(date);
            }
            if self.done {
                return None;
            }
            match self.rule.period_start(self.dtstart, self.period) {
                Some(start) if start < self.stop => {
                    self.buffer.extend(self.rule.period_dates(start, self.dtstart));
                    self.period += 1;
                }
                _ => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

/// A schedule: start date plus the rules and explicit dates that shape it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Recurrence {
    pub dtstart: Date,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub exclusion_rules: Vec<Rule>,
    /// Extra one-off dates.
    #[serde(default)]
    pub dates: Vec<Date>,
    #[serde(default)]
    pub exception_dates: Vec<Date>,
    /// When false, dtstart only occurs if a rule or explicit date produces it.
    #[serde(default)]
    pub include_dtstart: bool,
}

impl Recurrence {
    pub fn new(dtstart: Date) -> Self {
        Self {
            dtstart,
            rules: Vec::new(),
            exclusion_rules: Vec::new(),
            dates: Vec::new(),
            exception_dates: Vec::new(),
            include_dtstart: false,
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_exclusion_rule(mut self, rule: Rule) -> Self {
        self.exclusion_rules.push(rule);
        self
    }

    pub fn with_date(mut self, date: Date) -> Self {
        self.dates.push(date);
        self
    }

    pub fn with_exception(mut self, date: Date) -> Self {
        self.exception_dates.push(date);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.rules
            .iter()
            .chain(&self.exclusion_rules)
            .try_for_each(|rule| rule.validate(self.dtstart))
    }

    /// Dates in `[start, end)`, ascending, without duplicates.
    pub fn dates_between(&self, start: Date, end: Date) -> Occurrences<'_> {
        let mut explicit: BTreeSet<Date> = self.dates.iter().copied().collect();
        if self.include_dtstart {
            explicit.insert(self.dtstart);
        }

        let mut sources: Vec<Peekable<Box<dyn Iterator<Item = Date> + '_>>> = self
            .rules
            .iter()
            .map(|r| {
                let it: Box<dyn Iterator<Item = Date> + '_> =
                    Box::new(r.dates(self.dtstart, start, end));
                it.peekable()
            })
            .collect();
        let explicit: Box<dyn Iterator<Item = Date> + '_> = Box::new(explicit.into_iter());
        sources.push(explicit.peekable());

        Occurrences {
            sources,
            exclusions: self
                .exclusion_rules
                .iter()
                .map(|r| r.dates(self.dtstart, start, end).peekable())
                .collect(),
            exceptions: self.exception_dates.iter().copied().collect(),
            start,
            end,
        }
    }

    /// Concrete UTC start times in `[start, end)` for a scan that runs at
    /// `time_of_day` on every occurrence date.
    pub fn occurrences(
        &self,
        time_of_day: Time,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> impl Iterator<Item = OffsetDateTime> + '_ {
        let start = start.to_offset(UtcOffset::UTC);
        let end = end.to_offset(UtcOffset::UTC);
        let last_day = end.date().next_day().unwrap_or(Date::MAX);
        self.dates_between(start.date(), last_day)
            .map(move |d| PrimitiveDateTime::new(d, time_of_day).assume_utc())
            .skip_while(move |at| *at < start)
            .take_while(move |at| *at < end)
    }
}

/// Lazy merge of every date source of a [`Recurrence`].
pub struct Occurrences<'a> {
    sources: Vec<Peekable<Box<dyn Iterator<Item = Date> + 'a>>>,
    exclusions: Vec<Peekable<RuleDates<'a>>>,
    exceptions: BTreeSet<Date>,
    start: Date,
    end: Date,
}

impl Occurrences<'_> {
    fn excluded(&mut self, date: Date) -> bool {
        if self.exceptions.contains(&date) {
            return true;
        }
        let mut hit = false;
        for rule in &mut self.exclusions {
            while rule.next_if(|d| *d < date).is_some() {}
            hit |= rule.peek() == Some(&date);
        }
        hit
    }
}

impl Iterator for Occurrences<'_> {
    type Item = Date;

    fn next(&mut self) -> Option<Date> {
        loop {
            let next = self
                .sources
                .iter_mut()
                .filter_map(|s| s.peek().copied())
                .min()?;
            for source in &mut self.sources {
                while source.next_if_eq(&next).is_some() {}
            }
            if next >= self.end {
                return None;
            }
            if next < self.start || self.excluded(next) {
                continue;
            }
            return Some(next);
        }
    }
}
