use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Current layout of a persisted balance record.
pub const BALANCE_SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointType {
    Ticket,
    Diamond,
}

impl PointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointType::Ticket => "ticket",
            PointType::Diamond => "diamond",
        }
    }
}

impl std::fmt::Display for PointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PointType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ticket" | "tickets" => Ok(PointType::Ticket),
            "diamond" | "diamonds" => Ok(PointType::Diamond),
            _ => Err(format!("Unknown point type: {}", s)),
        }
    }
}

/// Snapshot of both counters, as shown to clients in `pointsRemaining`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Points {
    pub tickets: u32,
    pub diamonds: u32,
}

impl Points {
    pub fn get(&self, point_type: PointType) -> u32 {
        match point_type {
            PointType::Ticket => self.tickets,
            PointType::Diamond => self.diamonds,
        }
    }
}

/// Per-user balance record. Only the quota ledger mutates it.
///
/// Replenishment stamps are calendar values in the account's timezone:
/// `last_ticket_replenish_at` is the local day of the last daily grant and
/// `last_diamond_replenish_at` is the first day of the month of the last
/// monthly grant. `version` is the optimistic-concurrency counter and is
/// bumped on every successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: String,
    pub tickets: u32,
    pub diamonds: u32,
    pub last_ticket_replenish_at: NaiveDate,
    pub last_diamond_replenish_at: NaiveDate,
    pub timezone: Tz,
    pub schema_version: u16,
    pub version: u64,
}

impl Balance {
    pub fn points(&self) -> Points {
        Points {
            tickets: self.tickets,
            diamonds: self.diamonds,
        }
    }

    fn counter_mut(&mut self, point_type: PointType) -> &mut u32 {
        match point_type {
            PointType::Ticket => &mut self.tickets,
            PointType::Diamond => &mut self.diamonds,
        }
    }

    /// Removes `cost` points. Leaves the balance untouched and returns
    /// `false` when that would go below zero.
    pub fn try_debit(&mut self, point_type: PointType, cost: u32) -> bool {
        let counter = self.counter_mut(point_type);
        match counter.checked_sub(cost) {
            Some(rest) => {
                *counter = rest;
                true
            }
            None => false,
        }
    }

    /// Adds `amount` points. Returns `false` on integer overflow.
    pub fn try_credit(&mut self, point_type: PointType, amount: u32) -> bool {
        let counter = self.counter_mut(point_type);
        match counter.checked_add(amount) {
            Some(total) => {
                *counter = total;
                true
            }
            None => false,
        }
    }

    pub fn set(&mut self, point_type: PointType, amount: u32) {
        *self.counter_mut(point_type) = amount;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance(tickets: u32, diamonds: u32) -> Balance {
        Balance {
            user_id: "u1".to_string(),
            tickets,
            diamonds,
            last_ticket_replenish_at: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            last_diamond_replenish_at: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            timezone: Tz::UTC,
            schema_version: BALANCE_SCHEMA_VERSION,
            version: 0,
        }
    }

    #[test]
    fn test_debit_rejects_overdraw() {
        let mut b = balance(1, 0);
        assert!(!b.try_debit(PointType::Ticket, 2));
        assert_eq!(b.tickets, 1);
        assert!(!b.try_debit(PointType::Diamond, 1));
        assert_eq!(b.diamonds, 0);
        assert!(b.try_debit(PointType::Ticket, 1));
        assert_eq!(b.tickets, 0);
    }

    #[test]
    fn test_credit_overflow() {
        let mut b = balance(u32::MAX, 0);
        assert!(!b.try_credit(PointType::Ticket, 1));
        assert_eq!(b.tickets, u32::MAX);
        assert!(b.try_credit(PointType::Diamond, 3));
        assert_eq!(b.points(), Points { tickets: u32::MAX, diamonds: 3 });
    }

    #[test]
    fn test_point_type_parsing() {
        assert_eq!("Ticket".parse::<PointType>().unwrap(), PointType::Ticket);
        assert_eq!("diamonds".parse::<PointType>().unwrap(), PointType::Diamond);
        assert!("coin".parse::<PointType>().is_err());
        assert_eq!(PointType::Diamond.to_string(), "diamond");
    }
}
