//! Dashboard tiles and the monthly report.
//!
//! Everything here is computed in memory from rows already loaded for one
//! tenant; no aggregation is pushed down into the backends.

use std::collections::BTreeMap;

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::models::{Payment, PaymentType, Router, RouterStatus, Sale, SubscriberView};
use crate::status::SubscriberStatus;

/// Dashboard summary for one tenant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_subscribers: usize,
    pub active_subscribers: usize,
    pub expiring_subscribers: usize,
    pub expired_subscribers: usize,
    pub stopped_subscribers: usize,
    pub indebted_subscribers: usize,
    pub total_routers: usize,
    pub online_routers: usize,
    /// Number of cards sold
    pub total_sales: u64,
    /// Payments plus sales, all time
    pub total_revenue: f64,
    /// Payments dated in the current month
    pub monthly_revenue: f64,
    /// Payments and sales dated today
    pub today_revenue: f64,
    pub new_subscribers_this_month: usize,
    pub expired_this_month: usize,
    pub average_speed: f64,
}

/// A calendar month, serialized as `YYYY-MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Parse `YYYY-MM`
    pub fn parse(s: &str) -> Option<Self> {
        let (y, m) = s.trim().split_once('-')?;
        let year: i32 = y.parse().ok()?;
        let month: u32 = m.parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, 1)?;
        Some(Self { year, month })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    /// The month `n` months before this one
    pub fn minus(&self, n: u32) -> Self {
        self.first_day()
            .and_then(|d| d.checked_sub_months(Months::new(n)))
            .map(Self::of)
            .unwrap_or(*self)
    }
}

impl std::fmt::Display for YearMonth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl Serialize for YearMonth {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountAmount {
    pub count: usize,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyIncome {
    pub month: YearMonth,
    pub income: f64,
    pub subscriptions: usize,
    pub extensions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedBucket {
    pub speed: u32,
    pub count: usize,
}

/// Report for one month plus a six month income trend
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyReport {
    pub month: YearMonth,
    pub subscriptions: CountAmount,
    pub extensions: CountAmount,
    /// `count` here is the number of cards, not ledger lines
    pub card_sales: CountAmount,
    pub total_income: f64,
    pub new_subscribers: usize,
    pub expired_subscribers: usize,
    pub last_six_months: Vec<MonthlyIncome>,
    pub speed_distribution: Vec<SpeedBucket>,
}

pub fn dashboard(
    subscribers: &[SubscriberView],
    routers: &[Router],
    sales: &[Sale],
    payments: &[Payment],
    today: NaiveDate,
) -> DashboardStats {
    let month = YearMonth::of(today);
    let mut stats = DashboardStats {
        total_subscribers: subscribers.len(),
        total_routers: routers.len(),
        online_routers: routers.iter().filter(|r| r.status == RouterStatus::Online).count(),
        ..Default::default()
    };

    for view in subscribers {
        match view.status {
            SubscriberStatus::Active => stats.active_subscribers += 1,
            SubscriberStatus::Expiring => stats.expiring_subscribers += 1,
            SubscriberStatus::Expired => stats.expired_subscribers += 1,
            SubscriberStatus::Stopped => stats.stopped_subscribers += 1,
            SubscriberStatus::Indebted => stats.indebted_subscribers += 1,
        }
        let sub = &view.subscriber;
        if sub.start_date.is_some_and(|d| month.contains(d)) {
            stats.new_subscribers_this_month += 1;
        }
        if view.days_left < 0 && sub.expire_date.is_some_and(|d| month.contains(d)) {
            stats.expired_this_month += 1;
        }
    }

    stats.total_sales = sales.iter().map(|s| u64::from(s.count)).sum();
    let sales_total: f64 = sales.iter().map(|s| s.price).sum();
    let payments_total: f64 = payments.iter().map(|p| p.amount).sum();
    stats.total_revenue = sales_total + payments_total;
    stats.monthly_revenue = payments.iter().filter(|p| month.contains(p.date)).map(|p| p.amount).sum();
    stats.today_revenue = payments.iter().filter(|p| p.date == today).map(|p| p.amount).sum::<f64>()
        + sales.iter().filter(|s| s.date == today).map(|s| s.price).sum::<f64>();

    if !subscribers.is_empty() {
        let speed_sum: u64 = subscribers.iter().map(|v| u64::from(v.subscriber.speed)).sum();
        stats.average_speed = speed_sum as f64 / subscribers.len() as f64;
    }

    stats
}

pub fn monthly_report(
    subscribers: &[SubscriberView],
    sales: &[Sale],
    payments: &[Payment],
    month: YearMonth,
) -> MonthlyReport {
    let mut subscriptions = CountAmount::default();
    let mut extensions = CountAmount::default();
    for p in payments.iter().filter(|p| month.contains(p.date)) {
        let bucket = match p.payment_type {
            PaymentType::Subscription => &mut subscriptions,
            PaymentType::Extension => &mut extensions,
        };
        bucket.count += 1;
        bucket.amount += p.amount;
    }

    let mut card_sales = CountAmount::default();
    for s in sales.iter().filter(|s| month.contains(s.date)) {
        card_sales.count += s.count as usize;
        card_sales.amount += s.price;
    }

    let new_subscribers = subscribers
        .iter()
        .filter(|v| v.subscriber.start_date.is_some_and(|d| month.contains(d)))
        .count();
    let expired_subscribers = subscribers
        .iter()
        .filter(|v| matches!(v.status, SubscriberStatus::Expired | SubscriberStatus::Stopped))
        .filter(|v| v.subscriber.expire_date.is_some_and(|d| month.contains(d)))
        .count();

    let last_six_months = (0..6)
        .rev()
        .map(|n| {
            let m = month.minus(n);
            let month_payments: Vec<&Payment> = payments.iter().filter(|p| m.contains(p.date)).collect();
            let income = month_payments.iter().map(|p| p.amount).sum::<f64>()
                + sales.iter().filter(|s| m.contains(s.date)).map(|s| s.price).sum::<f64>();
            MonthlyIncome {
                month: m,
                income,
                subscriptions: month_payments
                    .iter()
                    .filter(|p| p.payment_type == PaymentType::Subscription)
                    .count(),
                extensions: month_payments
                    .iter()
                    .filter(|p| p.payment_type == PaymentType::Extension)
                    .count(),
            }
        })
        .collect();

    let mut speeds: BTreeMap<u32, usize> = BTreeMap::new();
    for v in subscribers {
        *speeds.entry(v.subscriber.speed).or_default() += 1;
    }

    MonthlyReport {
        month,
        total_income: subscriptions.amount + extensions.amount + card_sales.amount,
        subscriptions,
        extensions,
        card_sales,
        new_subscribers,
        expired_subscribers,
        last_six_months,
        speed_distribution: speeds
            .into_iter()
            .map(|(speed, count)| SpeedBucket { speed, count })
            .collect(),
    }
}

/// Subscribers that are about to lapse or already have
pub fn alerts(subscribers: &[SubscriberView]) -> Vec<SubscriberView> {
    let mut out: Vec<SubscriberView> = subscribers
        .iter()
        .filter(|v| v.status.needs_attention())
        .cloned()
        .collect();
    out.sort_by_key(|v| v.days_left);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{now_utc, SaleType, Subscriber, SubscriptionType};
    use crate::status::{view, StatusThresholds};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn subscriber(id: &str, speed: u32, start: NaiveDate, expire: NaiveDate, balance: f64) -> Subscriber {
        Subscriber {
            id: id.into(),
            tenant_id: "t".into(),
            name: id.into(),
            phone: None,
            address: None,
            subscription_type: SubscriptionType::Monthly,
            speed,
            start_date: Some(start),
            expire_date: Some(expire),
            max_devices: 1,
            balance,
            router_id: None,
            package_id: None,
            notes: None,
            created_at: now_utc(),
        }
    }

    fn payment(amount: f64, date: NaiveDate, payment_type: PaymentType) -> Payment {
        Payment {
            id: crate::models::new_id("payment"),
            tenant_id: "t".into(),
            subscriber_id: "s1".into(),
            amount,
            date,
            payment_type,
            method: "cash".into(),
            notes: None,
            created_by: None,
            created_at: now_utc(),
        }
    }

    fn sale(count: u32, price: f64, date: NaiveDate) -> Sale {
        Sale {
            id: crate::models::new_id("sale"),
            tenant_id: "t".into(),
            sale_type: SaleType::Retail,
            count,
            price,
            date,
            notes: None,
            created_at: now_utc(),
        }
    }

    fn views(today: NaiveDate) -> Vec<SubscriberView> {
        let t = StatusThresholds::default();
        vec![
            view(subscriber("s1", 20, date(2025, 12, 1), date(2026, 1, 1), 0.0), today, &t),
            view(subscriber("s2", 15, date(2025, 12, 2), date(2025, 12, 17), 0.0), today, &t),
            view(subscriber("s3", 30, date(2025, 11, 1), date(2025, 12, 10), 0.0), today, &t),
            view(subscriber("s4", 20, date(2025, 9, 1), date(2025, 10, 1), 0.0), today, &t),
            view(subscriber("s5", 10, date(2025, 11, 5), date(2026, 2, 1), -40.0), today, &t),
        ]
    }

    #[test]
    fn dashboard_counts_every_bucket() {
        let today = date(2025, 12, 15);
        let subs = views(today);
        let payments = vec![
            payment(100.0, date(2025, 12, 15), PaymentType::Subscription),
            payment(50.0, date(2025, 12, 3), PaymentType::Extension),
            payment(70.0, date(2025, 11, 20), PaymentType::Subscription),
        ];
        let sales = vec![sale(50, 500.0, date(2025, 12, 10)), sale(10, 150.0, date(2025, 12, 15))];

        let stats = dashboard(&subs, &[], &sales, &payments, today);
        assert_eq!(stats.total_subscribers, 5);
        assert_eq!(stats.active_subscribers, 1);
        assert_eq!(stats.expiring_subscribers, 1);
        assert_eq!(stats.expired_subscribers, 1);
        assert_eq!(stats.stopped_subscribers, 1);
        assert_eq!(stats.indebted_subscribers, 1);
        assert_eq!(stats.total_sales, 60);
        assert_eq!(stats.total_revenue, 870.0);
        assert_eq!(stats.monthly_revenue, 150.0);
        assert_eq!(stats.today_revenue, 250.0);
        assert_eq!(stats.new_subscribers_this_month, 2);
        assert_eq!(stats.expired_this_month, 1);
        assert_eq!(stats.average_speed, 19.0);
    }

    #[test]
    fn report_splits_payments_and_builds_trend() {
        let today = date(2025, 12, 15);
        let subs = views(today);
        let payments = vec![
            payment(100.0, date(2025, 12, 15), PaymentType::Subscription),
            payment(50.0, date(2025, 12, 3), PaymentType::Extension),
            payment(70.0, date(2025, 7, 20), PaymentType::Subscription),
        ];
        let sales = vec![sale(50, 500.0, date(2025, 12, 10))];

        let report = monthly_report(&subs, &sales, &payments, YearMonth::of(today));
        assert_eq!(report.subscriptions, CountAmount { count: 1, amount: 100.0 });
        assert_eq!(report.extensions, CountAmount { count: 1, amount: 50.0 });
        assert_eq!(report.card_sales, CountAmount { count: 50, amount: 500.0 });
        assert_eq!(report.total_income, 650.0);
        assert_eq!(report.new_subscribers, 2);
        assert_eq!(report.expired_subscribers, 1);

        assert_eq!(report.last_six_months.len(), 6);
        assert_eq!(report.last_six_months[0].month.to_string(), "2025-07");
        assert_eq!(report.last_six_months[0].income, 70.0);
        assert_eq!(report.last_six_months[5].month.to_string(), "2025-12");
        assert_eq!(report.last_six_months[5].extensions, 1);

        let speeds: Vec<(u32, usize)> = report.speed_distribution.iter().map(|b| (b.speed, b.count)).collect();
        assert_eq!(speeds, vec![(10, 1), (15, 1), (20, 2), (30, 1)]);
    }

    #[test]
    fn year_month_parsing_and_arithmetic() {
        let m = YearMonth::parse("2026-02").unwrap();
        assert_eq!(m.minus(2).to_string(), "2025-12");
        assert!(YearMonth::parse("2026-13").is_none());
        assert!(YearMonth::parse("garbage").is_none());
        assert_eq!(serde_json::to_string(&m).unwrap(), "\"2026-02\"");
    }

    #[test]
    fn alerts_are_sorted_by_urgency() {
        let today = date(2025, 12, 15);
        let ids: Vec<String> = alerts(&views(today)).into_iter().map(|v| v.subscriber.id).collect();
        assert_eq!(ids, vec!["s3", "s2"]);
    }
}
