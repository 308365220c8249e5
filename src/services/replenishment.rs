//! Calendar-based top-up rules.
//!
//! Tickets are granted once per local calendar day, diamonds once per local
//! calendar month. Missed periods are never back-paid: a user returning
//! after a week gets a single ticket grant.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::models::{Balance, PointType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplenishPeriod {
    Daily,
    Monthly,
}

/// How a grant combines with what the user still holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplenishMode {
    /// Grant is added on top of the remaining balance.
    Additive,
    /// Balance is set to the grant amount; leftovers are forfeited.
    Reset,
}

impl FromStr for ReplenishMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "additive" | "add" => Ok(ReplenishMode::Additive),
            "reset" => Ok(ReplenishMode::Reset),
            _ => Err(format!("Unknown replenish mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplenishmentRule {
    pub point_type: PointType,
    pub amount: u32,
    pub period: ReplenishPeriod,
    pub mode: ReplenishMode,
    /// Upper bound an additive grant may raise the balance to.
    pub cap: Option<u32>,
}

impl ReplenishmentRule {
    pub fn daily_tickets(amount: u32) -> Self {
        Self {
            point_type: PointType::Ticket,
            amount,
            period: ReplenishPeriod::Daily,
            mode: ReplenishMode::Additive,
            cap: None,
        }
    }

    pub fn monthly_diamonds(amount: u32) -> Self {
        Self {
            point_type: PointType::Diamond,
            amount,
            period: ReplenishPeriod::Monthly,
            mode: ReplenishMode::Additive,
            cap: None,
        }
    }

    pub fn with_mode(mut self, mode: ReplenishMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_cap(mut self, cap: Option<u32>) -> Self {
        self.cap = cap;
        self
    }

    /// Balance after one grant. A cap never takes points away.
    pub fn granted_balance(&self, current: u32) -> u32 {
        match self.mode {
            ReplenishMode::Reset => self.amount,
            ReplenishMode::Additive => {
                let topped_up = current.saturating_add(self.amount);
                match self.cap {
                    Some(cap) => topped_up.min(cap).max(current),
                    None => topped_up,
                }
            }
        }
    }
}

/// Local calendar date of `now` in `tz`.
pub fn local_date(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// True when `now` falls on a later local day than the last ticket grant.
pub fn is_ticket_replenish_due(last_replenish: NaiveDate, now: DateTime<Utc>, tz: Tz) -> bool {
    local_date(now, tz) > last_replenish
}

/// True when `now` falls in a different local month than the last diamond
/// grant. The day-of-month of `last_replenish` is ignored.
pub fn is_diamond_replenish_due(last_replenish: NaiveDate, now: DateTime<Utc>, tz: Tz) -> bool {
    let today = local_date(now, tz);
    (today.year(), today.month()) != (last_replenish.year(), last_replenish.month())
}

/// Next instant a rule of `period` fires for a user in `tz`.
pub fn next_replenish_at(period: ReplenishPeriod, now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let today = local_date(now, tz);
    let next_day = match period {
        ReplenishPeriod::Daily => today + Duration::days(1),
        ReplenishPeriod::Monthly => {
            let (year, month) = if today.month() == 12 {
                (today.year() + 1, 1)
            } else {
                (today.year(), today.month() + 1)
            };
            NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(today + Duration::days(31))
        }
    };

    local_midnight(next_day, tz)
}

fn local_midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let midnight = date.and_time(chrono::NaiveTime::MIN);
    resolve_local(midnight, tz)
        // midnight can fall in a DST gap; the first valid instant is an hour later
        .or_else(|| resolve_local(midnight + Duration::hours(1), tz))
        .unwrap_or_else(|| midnight.and_utc())
}

fn resolve_local(local: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Which grants a single `apply` call made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Replenished {
    pub tickets: bool,
    pub diamonds: bool,
}

impl Replenished {
    pub fn any(&self) -> bool {
        self.tickets || self.diamonds
    }
}

/// The pair of rules in force. Stateless; cheap to clone and share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplenishmentPolicy {
    ticket: ReplenishmentRule,
    diamond: ReplenishmentRule,
}

impl Default for ReplenishmentPolicy {
    fn default() -> Self {
        Self::new(
            ReplenishmentRule::daily_tickets(15),
            ReplenishmentRule::monthly_diamonds(5),
        )
    }
}

impl ReplenishmentPolicy {
    pub fn new(ticket: ReplenishmentRule, diamond: ReplenishmentRule) -> Self {
        Self { ticket, diamond }
    }

    pub fn rule(&self, point_type: PointType) -> &ReplenishmentRule {
        match point_type {
            PointType::Ticket => &self.ticket,
            PointType::Diamond => &self.diamond,
        }
    }

    /// Applies every grant that is due at `now` and advances the stamps.
    /// Calling it again within the same period changes nothing.
    pub fn apply(&self, balance: &mut Balance, now: DateTime<Utc>) -> Replenished {
        let tz = balance.timezone;
        let today = local_date(now, tz);
        let mut replenished = Replenished::default();

        if is_ticket_replenish_due(balance.last_ticket_replenish_at, now, tz) {
            let next = self.ticket.granted_balance(balance.tickets);
            balance.set(PointType::Ticket, next);
            balance.last_ticket_replenish_at = today;
            replenished.tickets = true;
        }

        if is_diamond_replenish_due(balance.last_diamond_replenish_at, now, tz) {
            let next = self.diamond.granted_balance(balance.diamonds);
            balance.set(PointType::Diamond, next);
            balance.last_diamond_replenish_at = month_start(today);
            replenished.diamonds = true;
        }

        replenished
    }

    pub fn next_replenish_at(
        &self,
        point_type: PointType,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> DateTime<Utc> {
        next_replenish_at(self.rule(point_type).period, now, tz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BALANCE_SCHEMA_VERSION;
    use chrono_tz::{America::New_York, America::Santiago, Asia::Tokyo};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn balance(tickets: u32, diamonds: u32, last_ticket: NaiveDate, last_diamond: NaiveDate) -> Balance {
        Balance {
            user_id: "student".to_string(),
            tickets,
            diamonds,
            last_ticket_replenish_at: last_ticket,
            last_diamond_replenish_at: last_diamond,
            timezone: Tz::UTC,
            schema_version: BALANCE_SCHEMA_VERSION,
            version: 0,
        }
    }

    #[test]
    fn test_ticket_due_only_after_local_midnight() {
        let last = date(2026, 3, 10);
        assert!(!is_ticket_replenish_due(last, utc(2026, 3, 10, 23, 59), Tz::UTC));
        assert!(is_ticket_replenish_due(last, utc(2026, 3, 11, 0, 1), Tz::UTC));
        assert!(is_ticket_replenish_due(last, utc(2026, 3, 20, 12, 0), Tz::UTC));
    }

    #[test]
    fn test_ticket_due_follows_account_timezone() {
        // 15:30 UTC on the 10th is already 00:30 on the 11th in Tokyo
        let last = date(2026, 3, 10);
        let now = utc(2026, 3, 10, 15, 30);
        assert!(is_ticket_replenish_due(last, now, Tokyo));
        assert!(!is_ticket_replenish_due(last, now, Tz::UTC));
        // and still the 10th in New York
        assert!(!is_ticket_replenish_due(last, utc(2026, 3, 11, 3, 0), New_York));
    }

    #[test]
    fn test_diamond_due_on_month_change() {
        let last = date(2026, 1, 1);
        assert!(!is_diamond_replenish_due(last, utc(2026, 1, 31, 23, 0), Tz::UTC));
        assert!(is_diamond_replenish_due(last, utc(2026, 2, 14, 9, 0), Tz::UTC));
        // same month number, different year
        assert!(is_diamond_replenish_due(last, utc(2027, 1, 15, 9, 0), Tz::UTC));
    }

    #[test]
    fn test_apply_grants_once_per_period() {
        let policy = ReplenishmentPolicy::default();
        let mut b = balance(0, 2, date(2026, 3, 9), date(2026, 3, 1));
        let now = utc(2026, 3, 10, 0, 1);

        let first = policy.apply(&mut b, now);
        assert!(first.tickets);
        assert!(!first.diamonds);
        assert_eq!(b.tickets, 15);
        assert_eq!(b.diamonds, 2);
        assert_eq!(b.last_ticket_replenish_at, date(2026, 3, 10));

        let second = policy.apply(&mut b, utc(2026, 3, 10, 22, 0));
        assert!(!second.any());
        assert_eq!(b.tickets, 15);
    }

    #[test]
    fn test_missed_days_are_not_back_paid() {
        let policy = ReplenishmentPolicy::default();
        let mut b = balance(3, 0, date(2026, 3, 1), date(2026, 3, 1));
        policy.apply(&mut b, utc(2026, 3, 8, 10, 0));
        assert_eq!(b.tickets, 18);
    }

    #[test]
    fn test_diamonds_roll_over_and_stamp_month_start() {
        let policy = ReplenishmentPolicy::default();
        let mut b = balance(0, 4, date(2026, 4, 30), date(2026, 4, 1));
        let replenished = policy.apply(&mut b, utc(2026, 5, 17, 8, 0));
        assert!(replenished.diamonds);
        assert_eq!(b.diamonds, 9);
        assert_eq!(b.last_diamond_replenish_at, date(2026, 5, 1));
    }

    #[test]
    fn test_reset_mode_forfeits_leftovers() {
        let rule = ReplenishmentRule::daily_tickets(15).with_mode(ReplenishMode::Reset);
        assert_eq!(rule.granted_balance(7), 15);
        assert_eq!(rule.granted_balance(40), 15);
    }

    #[test]
    fn test_cap_limits_rollover_without_clawback() {
        let rule = ReplenishmentRule::monthly_diamonds(5).with_cap(Some(12));
        assert_eq!(rule.granted_balance(4), 9);
        assert_eq!(rule.granted_balance(10), 12);
        assert_eq!(rule.granted_balance(20), 20);
    }

    #[test]
    fn test_next_replenish_times() {
        let now = utc(2026, 12, 31, 10, 0);
        assert_eq!(
            next_replenish_at(ReplenishPeriod::Daily, now, Tz::UTC),
            utc(2027, 1, 1, 0, 0)
        );
        assert_eq!(
            next_replenish_at(ReplenishPeriod::Monthly, now, Tz::UTC),
            utc(2027, 1, 1, 0, 0)
        );
        // Tokyo midnight is 15:00 UTC the previous day
        assert_eq!(
            next_replenish_at(ReplenishPeriod::Daily, utc(2026, 6, 1, 3, 0), Tokyo),
            utc(2026, 6, 1, 15, 0)
        );
    }

    #[test]
    fn test_midnight_skipped_by_dst_falls_back_an_hour() {
        // Santiago springs forward at local midnight on 2026-09-06 (-04 to -03)
        let noon_before = utc(2026, 9, 5, 16, 0);
        assert_eq!(
            next_replenish_at(ReplenishPeriod::Daily, noon_before, Santiago),
            utc(2026, 9, 6, 4, 0)
        );

        let last = date(2026, 9, 5);
        assert!(!is_ticket_replenish_due(last, utc(2026, 9, 6, 3, 59), Santiago));
        assert!(is_ticket_replenish_due(last, utc(2026, 9, 6, 4, 0), Santiago));
    }
}
