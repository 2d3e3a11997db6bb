//! Payroll history reads for the forecaster.
//!
//! Period calculation and payment flows belong to the payroll engine; this
//! module only reads what has already been paid.

use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::error::AiResult;

use super::Store;

/// One completed payroll period with its entry totals, oldest first when
/// returned from `payroll_history`.
#[derive(Debug, Clone, Serialize)]
pub struct PayrollPeriodTotals {
    pub period_id: i64,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub regular_hours: f64,
    pub overtime_hours: f64,
    pub gross_amount: f64,
    pub employee_count: i64,
}

impl Store {
    /// Up to `limit` most recent paid periods of the given type, returned
    /// oldest first for time-series math.
    pub fn payroll_history(&self, period_type: &str, limit: i64) -> AiResult<Vec<PayrollPeriodTotals>> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT pp.id, pp.start_date, pp.end_date,
                    COALESCE(SUM(pe.regular_hours), 0),
                    COALESCE(SUM(pe.overtime_hours), 0),
                    COALESCE(SUM(pe.gross_amount), 0),
                    COUNT(pe.id)
             FROM payroll_periods pp
             LEFT JOIN payroll_entries pe ON pe.payroll_period_id = pp.id
             WHERE pp.period_type = ?1 AND pp.status = 'paid'
             GROUP BY pp.id
             ORDER BY pp.start_date DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![period_type, limit], |r| {
            Ok(PayrollPeriodTotals {
                period_id: r.get(0)?,
                period_start: r.get::<_, String>(1)?.parse().unwrap_or_default(),
                period_end: r.get::<_, String>(2)?.parse().unwrap_or_default(),
                regular_hours: r.get(3)?,
                overtime_hours: r.get(4)?,
                gross_amount: r.get(5)?,
                employee_count: r.get(6)?,
            })
        })?;
        let mut history = rows.collect::<Result<Vec<_>, _>>()?;
        history.reverse();
        Ok(history)
    }

    /// The user's current hourly rate: most recent active rate still in
    /// effect today.
    pub fn active_pay_rate(&self, user_id: i64, today: NaiveDate) -> AiResult<Option<f64>> {
        let db = self.conn();
        let rate = db
            .query_row(
                "SELECT base_rate FROM pay_rates \
                 WHERE user_id = ?1 AND is_active = 1 \
                   AND (effective_to IS NULL OR effective_to >= ?2) \
                 ORDER BY effective_from DESC LIMIT 1",
                params![user_id, today.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(rate)
    }

    // ── Fixture helpers for embedding and tests ─────────────────────

    pub fn insert_payroll_period(
        &self,
        period_type: &str,
        status: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> AiResult<i64> {
        let db = self.conn();
        db.execute(
            "INSERT INTO payroll_periods (period_type, status, start_date, end_date) \
             VALUES (?1, ?2, ?3, ?4)",
            params![period_type, status, start.to_string(), end.to_string()],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn insert_payroll_entry(
        &self,
        period_id: i64,
        user_id: i64,
        regular_hours: f64,
        overtime_hours: f64,
        gross_amount: f64,
    ) -> AiResult<i64> {
        let db = self.conn();
        db.execute(
            "INSERT INTO payroll_entries \
             (payroll_period_id, user_id, regular_hours, overtime_hours, gross_amount)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![period_id, user_id, regular_hours, overtime_hours, gross_amount],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn insert_pay_rate(
        &self,
        user_id: i64,
        base_rate: f64,
        effective_from: NaiveDate,
    ) -> AiResult<i64> {
        let db = self.conn();
        db.execute(
            "INSERT INTO pay_rates (user_id, base_rate, is_active, effective_from) \
             VALUES (?1, ?2, 1, ?3)",
            params![user_id, base_rate, effective_from.to_string()],
        )?;
        Ok(db.last_insert_rowid())
    }
}
