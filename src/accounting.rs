//! Accounting operations layered on the query façade: statistics, payments,
//! the settings document and storage info.

use std::{collections::BTreeMap, str::FromStr};

use rust_decimal::{
    prelude::{FromPrimitive, ToPrimitive},
    Decimal,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tallybook_core::{
    dates::{format_date, format_timestamp, parse_date, parse_timestamp},
    Key, Record, StorageError, REQUIRED_BACKUP_STORES,
};
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::{
    collaborators::{Mailer, TaxAuthority},
    query::Database,
};

const SETTINGS_STORE: &str = "settings";
const SETTINGS_KEY: &str = "settings";

/// Reads a money field. Missing or unparseable values count as zero.
pub fn decimal_of(value: Option<&Value>) -> Decimal {
    match value {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => Decimal::from(i),
            None => n.as_f64().and_then(Decimal::from_f64).unwrap_or_default(),
        },
        Some(Value::String(s)) => Decimal::from_str(s.trim()).unwrap_or_default(),
        _ => Decimal::ZERO,
    }
}

/// Writes a money value back as a JSON number, an integer when it has no
/// fractional part.
pub fn decimal_value(amount: Decimal) -> Value {
    let amount = amount.normalize();
    let number = if amount.fract().is_zero() {
        amount.to_i64().map(Value::from)
    } else {
        amount.to_f64().map(Value::from)
    };
    number.unwrap_or_else(|| Value::String(amount.to_string()))
}

fn date_of(record: &Record, field: &str) -> Option<Date> {
    record.get(field).and_then(Value::as_str).and_then(parse_date)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialStats {
    pub revenue: Decimal,
    pub expenses: Decimal,
    pub net_profit: Decimal,
    pub outstanding: Decimal,
    pub invoice_count: usize,
    pub expense_count: usize,
    pub average_invoice: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerSummary {
    pub invoice_count: usize,
    pub total: Decimal,
    pub paid: Decimal,
    pub balance: Decimal,
    pub last_invoice: Option<Record>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    pub payment_id: String,
    pub invoice: Record,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub company_name: String,
    pub tax_number: String,
    pub address: String,
    pub phone: String,
    pub email: String,
    pub currency: String,
    pub tax_rate: f64,
    pub invoice_prefix: String,
    pub invoice_notes: String,
    pub logo: String,
    pub website: String,
    #[serde(flatten)]
    pub extra: Record,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            company_name: "شركة النخبة للتجارة".to_string(),
            tax_number: "310000000003".to_string(),
            address: "الرياض، المملكة العربية السعودية".to_string(),
            phone: "+966500000000".to_string(),
            email: "info@company.com".to_string(),
            currency: "ر.س".to_string(),
            tax_rate: 15.0,
            invoice_prefix: "INV-".to_string(),
            invoice_notes: "شكراً لتعاملكم معنا\nيرجى السداد خلال 30 يوم".to_string(),
            logo: String::new(),
            website: "www.company.com".to_string(),
            extra: Record::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseInfo {
    pub engine: String,
    pub schema_version: u32,
    pub stores: BTreeMap<String, usize>,
    pub total_records: usize,
    /// Bytes of the export document for the required stores.
    pub estimated_size: u64,
    pub last_backup: Option<String>,
}

impl Database {
    /// Revenue, expenses and profit for invoices and expenses dated within
    /// `from..=to`.
    pub fn financial_stats(&self, from: Date, to: Date) -> Result<FinancialStats, StorageError> {
        let in_range = |r: &Record| date_of(r, "date").map(|d| d >= from && d <= to).unwrap_or(false);

        let (revenue, outstanding, invoice_count) = self.aggregate(
            "invoices",
            &in_range,
            (Decimal::ZERO, Decimal::ZERO, 0usize),
            |(revenue, outstanding, n), r| {
                (
                    revenue + decimal_of(r.get("total")),
                    outstanding + decimal_of(r.get("balance")),
                    n + 1,
                )
            },
        )?;
        let (expenses, expense_count) = self.aggregate(
            "expenses",
            &in_range,
            (Decimal::ZERO, 0usize),
            |(sum, n), r| (sum + decimal_of(r.get("amount")), n + 1),
        )?;

        let average_invoice = if invoice_count > 0 {
            (revenue / Decimal::from(invoice_count)).round_dp(2)
        } else {
            Decimal::ZERO
        };
        Ok(FinancialStats {
            revenue,
            expenses,
            net_profit: revenue - expenses,
            outstanding,
            invoice_count,
            expense_count,
            average_invoice,
        })
    }

    pub fn customer_summary(&self, customer_id: &Key) -> Result<CustomerSummary, StorageError> {
        self.require("customers", customer_id)?;
        let invoices = self.query_by_index("invoices", "customerId", customer_id.as_index_value())?;

        let mut summary = CustomerSummary {
            invoice_count: invoices.len(),
            ..CustomerSummary::default()
        };
        for invoice in &invoices {
            summary.total += decimal_of(invoice.get("total"));
            summary.paid += decimal_of(invoice.get("paid"));
        }
        summary.balance = summary.total - summary.paid;
        summary.last_invoice = invoices.into_iter().max_by_key(|r| date_of(r, "date"));
        Ok(summary)
    }

    /// Applies a payment to an invoice and records it in `payments`. On the
    /// primary engines the read, the invoice update and the payment insert
    /// share one transaction; the fallback adapter has none and writes them
    /// one after the other.
    pub fn apply_payment(
        &self,
        invoice_id: &Key,
        amount: Decimal,
        method: &str,
        date: Date,
    ) -> Result<PaymentReceipt, StorageError> {
        if amount <= Decimal::ZERO {
            return Err(StorageError::Validation(format!("payment amount must be positive, got {}", amount)));
        }

        let tx = if self.engine_name() == "fallback" {
            None
        } else {
            Some(self.backend().begin_transaction()?)
        };
        let applied = self.record_payment(invoice_id, amount, method, date);
        match (applied, tx) {
            (Ok(receipt), Some(tx_id)) => {
                self.backend().commit_transaction(tx_id)?;
                Ok(receipt)
            }
            (Ok(receipt), None) => Ok(receipt),
            (Err(e), Some(tx_id)) => {
                self.backend().rollback_transaction(tx_id)?;
                Err(e)
            }
            (Err(e), None) => Err(e),
        }
    }

    fn record_payment(
        &self,
        invoice_id: &Key,
        amount: Decimal,
        method: &str,
        date: Date,
    ) -> Result<PaymentReceipt, StorageError> {
        let mut invoice = self.require("invoices", invoice_id)?;
        if invoice.get("status").and_then(Value::as_str) == Some("cancelled") {
            return Err(StorageError::Validation(format!("invoice {} is cancelled", invoice_id)));
        }

        let total = decimal_of(invoice.get("total"));
        let paid = decimal_of(invoice.get("paid"));
        let balance = match invoice.get("balance") {
            Some(v) if !v.is_null() => decimal_of(Some(v)),
            _ => total - paid,
        };
        if amount > balance {
            return Err(StorageError::Validation(format!(
                "payment {} exceeds outstanding balance {}",
                amount, balance
            )));
        }

        let now = format_timestamp(self.now());
        let new_paid = paid + amount;
        let new_balance = balance - amount;
        let status = if new_balance <= Decimal::ZERO { "paid" } else { "partial" };
        invoice.insert("paid".to_string(), decimal_value(new_paid));
        invoice.insert("balance".to_string(), decimal_value(new_balance));
        invoice.insert("status".to_string(), Value::from(status));
        invoice.insert("updatedAt".to_string(), Value::from(now.clone()));

        let payment_id = format!("payment_{}", Uuid::new_v4());
        let mut payment = Record::new();
        payment.insert("id".to_string(), Value::from(payment_id.clone()));
        payment.insert("invoiceId".to_string(), invoice_id.to_value());
        payment.insert("amount".to_string(), decimal_value(amount));
        payment.insert("method".to_string(), Value::from(method));
        payment.insert("date".to_string(), Value::from(format_date(date)));
        payment.insert("createdAt".to_string(), Value::from(now));

        self.update("invoices", invoice_id, invoice.clone())?;
        self.add("payments", payment)?;

        tracing::info!(invoice = %invoice_id, amount = %amount, status, "Payment applied");
        Ok(PaymentReceipt { payment_id, invoice })
    }

    pub fn settings(&self) -> Result<Settings, StorageError> {
        match self.get(SETTINGS_STORE, &Key::from(SETTINGS_KEY))? {
            Some(record) => {
                let mut settings: Settings = serde_json::from_value(Value::Object(record))?;
                settings.extra.remove("key");
                Ok(settings)
            }
            None => Ok(Settings::default()),
        }
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<(), StorageError> {
        let Value::Object(mut record) = serde_json::to_value(settings)? else {
            return Err(StorageError::Other("settings did not serialize to an object".to_string()));
        };
        record.insert("key".to_string(), Value::from(SETTINGS_KEY));
        self.put(SETTINGS_STORE, record)?;
        Ok(())
    }

    pub fn database_info(&self) -> Result<DatabaseInfo, StorageError> {
        let names = self.store_names();
        let mut stores = BTreeMap::new();
        for name in &names {
            stores.insert(name.clone(), self.count(name)?);
        }

        let mut export = BTreeMap::new();
        for name in REQUIRED_BACKUP_STORES.iter().filter(|s| names.iter().any(|n| n == *s)) {
            export.insert(*name, self.get_all(name)?);
        }
        let estimated_size = serde_json::to_vec(&export)?.len() as u64;

        let last_backup = if names.iter().any(|n| n == "backups") {
            self.get_all("backups")?
                .iter()
                .filter_map(|r| r.get("timestamp").and_then(Value::as_str))
                .filter_map(|ts| parse_timestamp(ts).map(|parsed| (parsed, ts.to_string())))
                .max()
                .map(|(_, ts)| ts)
        } else {
            None
        };

        Ok(DatabaseInfo {
            engine: self.engine_name().to_string(),
            schema_version: self.schema_version()?,
            total_records: stores.values().sum(),
            stores,
            estimated_size,
            last_backup,
        })
    }

    /// Deletes activity records older than `days` before `now`.
    pub fn cleanup_old_activities(&self, days: u32, now: OffsetDateTime) -> Result<usize, StorageError> {
        let cutoff = now - Duration::days(i64::from(days));
        let def = self.store_def("activities")?;
        let stale: Vec<Key> = self
            .get_all("activities")?
            .iter()
            .filter(|r| {
                r.get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(parse_timestamp)
                    .map(|ts| ts < cutoff)
                    .unwrap_or(false)
            })
            .filter_map(|r| def.key_of(r).ok().flatten())
            .collect();
        let report = self.bulk_delete("activities", &stale)?;
        if !report.is_complete() {
            tracing::warn!(failed = report.failed.len(), "Some activities could not be removed");
        }
        tracing::info!(deleted = report.succeeded.len(), days, "Old activities removed");
        Ok(report.succeeded.len())
    }

    /// Emails an invoice to its customer. Returns the mailer's message id.
    pub fn send_invoice(&self, mailer: &dyn Mailer, invoice_id: &Key) -> Result<String, StorageError> {
        let invoice = self.require("invoices", invoice_id)?;
        let customer_id = invoice
            .get("customerId")
            .and_then(Key::from_value)
            .ok_or_else(|| StorageError::Validation(format!("invoice {} has no customer", invoice_id)))?;
        let customer = self.require("customers", &customer_id)?;
        let email = customer
            .get("email")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| StorageError::Validation(format!("customer {} has no email", customer_id)))?;

        let settings = self.settings()?;
        let number = invoice
            .get("invoiceNumber")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| invoice_id.to_string());
        let subject = format!("Invoice {} from {}", number, settings.company_name);
        let body = format!(
            "Total: {} {}\nBalance due: {} {}\n\n{}",
            decimal_of(invoice.get("total")),
            settings.currency,
            decimal_of(invoice.get("balance")),
            settings.currency,
            settings.invoice_notes
        );
        let message_id = mailer.send_email(email, &subject, &body)?;
        tracing::info!(invoice = %invoice_id, message_id = %message_id, "Invoice sent");
        Ok(message_id)
    }

    /// Submits an invoice to the tax authority and stores the submission id
    /// on the invoice.
    pub fn submit_invoice(&self, tax: &dyn TaxAuthority, invoice_id: &Key) -> Result<String, StorageError> {
        let mut invoice = self.require("invoices", invoice_id)?;
        if invoice.get("status").and_then(Value::as_str) == Some("draft") {
            return Err(StorageError::Validation(format!("invoice {} is still a draft", invoice_id)));
        }
        let submission_id = tax.submit_to_tax_authority(&invoice)?;
        invoice.insert("taxSubmissionId".to_string(), Value::from(submission_id.clone()));
        self.update("invoices", invoice_id, invoice)?;
        tracing::info!(invoice = %invoice_id, submission_id = %submission_id, "Invoice submitted to tax authority");
        Ok(submission_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::collaborators::{NoopMailer, NoopTaxAuthority};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::Arc;
    use tallybook_core::{Schema, SCHEMA_VERSION};
    use tallybook_memory::InMemoryStorage;
    use time::macros::{date, datetime};

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn db() -> Database {
        let storage = InMemoryStorage::with_schema(&Schema::accounting(), SCHEMA_VERSION).unwrap();
        Database::new(Arc::new(storage))
    }

    #[test]
    fn test_decimal_helpers() {
        assert_eq!(decimal_of(Some(&json!(1000))), dec!(1000));
        assert_eq!(decimal_of(Some(&json!(12.5))), dec!(12.5));
        assert_eq!(decimal_of(Some(&json!("99.90"))), dec!(99.90));
        assert_eq!(decimal_of(Some(&json!(null))), Decimal::ZERO);
        assert_eq!(decimal_of(None), Decimal::ZERO);
        assert_eq!(decimal_value(dec!(1000.00)), json!(1000));
        assert_eq!(decimal_value(dec!(0.5)), json!(0.5));
    }

    #[test]
    fn test_financial_stats_filters_by_date() {
        let db = db();
        for (id, date, total, balance) in [
            ("i1", "2024-01-10", 1000, 0),
            ("i2", "2024-01-31", 500, 500),
            ("i3", "2024-02-01", 700, 700),
        ] {
            db.add(
                "invoices",
                record(json!({"id": id, "date": date, "total": total, "balance": balance})),
            )
            .unwrap();
        }
        db.add("expenses", record(json!({"id": "e1", "date": "2024-01-15", "amount": 300.25})))
            .unwrap();
        db.add("expenses", record(json!({"id": "e2", "date": "2023-12-31", "amount": 50})))
            .unwrap();

        let stats = db.financial_stats(date!(2024 - 01 - 01), date!(2024 - 01 - 31)).unwrap();
        assert_eq!(stats.revenue, dec!(1500));
        assert_eq!(stats.outstanding, dec!(500));
        assert_eq!(stats.expenses, dec!(300.25));
        assert_eq!(stats.net_profit, dec!(1199.75));
        assert_eq!(stats.invoice_count, 2);
        assert_eq!(stats.expense_count, 1);
        assert_eq!(stats.average_invoice, dec!(750));
    }

    #[test]
    fn test_apply_payment_partial_then_paid() {
        let db = db();
        db.add("customers", record(json!({"id": "c1", "name": "Acme", "balance": 0}))).unwrap();
        db.add(
            "invoices",
            record(json!({"id": "i1", "customerId": "c1", "total": 1000, "paid": 0, "balance": 1000, "status": "unpaid"})),
        )
        .unwrap();
        let id = Key::from("i1");

        let receipt = db.apply_payment(&id, dec!(400), "cash", date!(2024 - 03 - 01)).unwrap();
        assert_eq!(receipt.invoice["status"], "partial");
        assert_eq!(receipt.invoice["balance"], json!(600));

        assert!(matches!(
            db.apply_payment(&id, dec!(601), "cash", date!(2024 - 03 - 02)),
            Err(StorageError::Validation(_))
        ));
        assert!(db.apply_payment(&id, Decimal::ZERO, "cash", date!(2024 - 03 - 02)).is_err());

        db.apply_payment(&id, dec!(600), "card", date!(2024 - 03 - 03)).unwrap();
        let invoice = db.require("invoices", &id).unwrap();
        assert_eq!(invoice["paid"], json!(1000));
        assert_eq!(invoice["balance"], json!(0));
        assert_eq!(invoice["status"], "paid");
        assert_eq!(db.query_by_index("payments", "invoiceId", "i1").unwrap().len(), 2);

        let summary = db.customer_summary(&Key::from("c1")).unwrap();
        assert_eq!(summary.invoice_count, 1);
        assert_eq!(summary.paid, dec!(1000));
        assert_eq!(summary.balance, Decimal::ZERO);
    }

    #[test]
    fn test_apply_payment_stamps_injected_clock() {
        let db = db().with_clock(Arc::new(FixedClock(datetime!(2024-03-05 09:30:00 UTC))));
        db.add(
            "invoices",
            record(json!({"id": "i1", "total": 250, "paid": 0, "balance": 250, "status": "unpaid"})),
        )
        .unwrap();

        let receipt = db.apply_payment(&Key::from("i1"), dec!(250), "bank", date!(2024 - 03 - 05)).unwrap();
        assert_eq!(receipt.invoice["updatedAt"], "2024-03-05T09:30:00Z");
        let payment = db.require("payments", &Key::from(receipt.payment_id.as_str())).unwrap();
        assert_eq!(payment["createdAt"], "2024-03-05T09:30:00Z");
        assert_eq!(db.require("invoices", &Key::from("i1")).unwrap()["updatedAt"], "2024-03-05T09:30:00Z");
    }

    #[test]
    fn test_failed_payment_releases_transaction() {
        let db = db();
        assert!(matches!(
            db.apply_payment(&Key::from("missing"), dec!(10), "cash", date!(2024 - 03 - 01)),
            Err(StorageError::NotFound { .. })
        ));
        let tx_id = db.backend().begin_transaction().unwrap();
        db.backend().commit_transaction(tx_id).unwrap();
    }

    #[test]
    fn test_settings_default_and_round_trip() {
        let db = db();
        let defaults = db.settings().unwrap();
        assert_eq!(defaults.tax_rate, 15.0);
        assert_eq!(defaults.invoice_prefix, "INV-");

        let mut settings = defaults.clone();
        settings.currency = "USD".to_string();
        settings.extra.insert("theme".to_string(), json!("dark"));
        db.save_settings(&settings).unwrap();
        db.save_settings(&settings).unwrap();

        assert_eq!(db.settings().unwrap(), settings);
        let stored = db.require("settings", &Key::from("settings")).unwrap();
        assert_eq!(stored["currency"], "USD");
        assert_eq!(stored["taxRate"], json!(15.0));
        assert_eq!(db.count("settings").unwrap(), 1);
    }

    #[test]
    fn test_database_info_and_activity_cleanup() {
        let db = db();
        let now = datetime!(2024-06-30 00:00 UTC);
        db.add("customers", record(json!({"id": "c1", "name": "Acme"}))).unwrap();
        for (id, ts) in [("a1", "2024-06-29T00:00:00Z"), ("a2", "2024-01-01T00:00:00Z")] {
            db.add("activities", record(json!({"id": id, "action": "login", "timestamp": ts})))
                .unwrap();
        }

        let info = db.database_info().unwrap();
        assert_eq!(info.schema_version, SCHEMA_VERSION);
        assert_eq!(info.stores["customers"], 1);
        assert_eq!(info.stores["activities"], 2);
        assert_eq!(info.total_records, 3);
        assert!(info.estimated_size > 0);
        assert!(info.last_backup.is_none());

        assert_eq!(db.cleanup_old_activities(90, now).unwrap(), 1);
        assert!(db.get("activities", &Key::from("a1")).unwrap().is_some());
    }

    #[test]
    fn test_send_and_submit_invoice() {
        let db = db();
        db.add("customers", record(json!({"id": "c1", "name": "Acme", "email": "billing@acme.test"})))
            .unwrap();
        db.add("customers", record(json!({"id": "c2", "name": "NoMail"}))).unwrap();
        db.add("invoices", record(json!({"id": "i1", "invoiceNumber": "INV-1", "customerId": "c1", "total": 10, "status": "unpaid"})))
            .unwrap();
        db.add("invoices", record(json!({"id": "i2", "customerId": "c2", "status": "draft"})))
            .unwrap();

        let message = db.send_invoice(&NoopMailer, &Key::from("i1")).unwrap();
        assert!(message.starts_with("msg_"));
        assert!(matches!(
            db.send_invoice(&NoopMailer, &Key::from("i2")),
            Err(StorageError::Validation(_))
        ));

        let submission = db.submit_invoice(&NoopTaxAuthority, &Key::from("i1")).unwrap();
        let invoice = db.require("invoices", &Key::from("i1")).unwrap();
        assert_eq!(invoice["taxSubmissionId"], json!(submission));
        assert!(db.submit_invoice(&NoopTaxAuthority, &Key::from("i2")).is_err());
    }
}
