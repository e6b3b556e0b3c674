//! Generated domains and the materialized per-campaign counters.
//!
//! Listing supports offset and cursor pagination. A cursor encodes the
//! `(sort_key, id)` tuple of the last row served, so the same cursor keeps
//! returning the same page even while workers insert concurrently.

use rusqlite::{OptionalExtension, params};
use serde_json::Value;
use uuid::Uuid;

use super::CampaignStore;
use super::models::{
    DomainCounters, DomainResultStatus, GeneratedDomain, GeneratedDomainRow, LeadBreakdown,
    LeadStatus, ResultBreakdown, parse_uuid,
};
use crate::errors::StoreError;

/// Hard cap on a single page of domains.
pub const MAX_DOMAIN_PAGE: i64 = 1000;

const DOMAIN_COLUMNS: &str = "id, campaign_id, domain_name, offset_index, created_at, \
     dns_status, dns_reason, http_status, http_reason, lead_status, domain_score, features, \
     last_http_fetched_at";

fn row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<GeneratedDomainRow> {
    Ok(GeneratedDomainRow {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        domain_name: row.get(2)?,
        offset_index: row.get(3)?,
        created_at: row.get(4)?,
        dns_status: row.get(5)?,
        dns_reason: row.get(6)?,
        http_status: row.get(7)?,
        http_reason: row.get(8)?,
        lead_status: row.get(9)?,
        domain_score: row.get(10)?,
        features: row.get(11)?,
        last_http_fetched_at: row.get(12)?,
    })
}

// ── Listing query types ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainSort {
    OffsetAsc,
    ScoreDesc,
    ScoreAsc,
    LastHttpFetchedAtDesc,
}

impl DomainSort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OffsetAsc => "offset_asc",
            Self::ScoreDesc => "score_desc",
            Self::ScoreAsc => "score_asc",
            Self::LastHttpFetchedAtDesc => "last_http_fetched_at_desc",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "offset_asc" => Ok(Self::OffsetAsc),
            "score_desc" => Ok(Self::ScoreDesc),
            "score_asc" => Ok(Self::ScoreAsc),
            "last_http_fetched_at_desc" => Ok(Self::LastHttpFetchedAtDesc),
            _ => Err(format!("Invalid sort: {}", s)),
        }
    }

    /// NULL scores sort below every real score; NULL fetch timestamps sort
    /// last in the descending order.
    fn key_expr(&self) -> &'static str {
        match self {
            Self::OffsetAsc => "offset_index",
            Self::ScoreDesc | Self::ScoreAsc => "COALESCE(domain_score, -1)",
            Self::LastHttpFetchedAtDesc => "COALESCE(last_http_fetched_at, '')",
        }
    }

    fn descending(&self) -> bool {
        matches!(self, Self::ScoreDesc | Self::LastHttpFetchedAtDesc)
    }

    fn key_of(&self, domain: &GeneratedDomain) -> String {
        match self {
            Self::OffsetAsc => domain.offset_index.to_string(),
            Self::ScoreDesc | Self::ScoreAsc => {
                domain.domain_score.unwrap_or(-1.0).to_string()
            }
            Self::LastHttpFetchedAtDesc => {
                domain.last_http_fetched_at.clone().unwrap_or_default()
            }
        }
    }
}

/// Opaque-on-the-wire cursor: `sort~key~id`. The separator is URL-safe so
/// the token survives a query string unencoded.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainCursor {
    pub sort: DomainSort,
    pub key: String,
    pub id: Uuid,
}

impl DomainCursor {
    pub fn encode(&self) -> String {
        format!("{}~{}~{}", self.sort.as_str(), self.key, self.id)
    }

    pub fn decode(raw: &str) -> Result<Self, String> {
        let mut parts = raw.splitn(3, '~');
        let sort = parts.next().ok_or_else(|| "empty cursor".to_string())?;
        let key = parts.next().ok_or_else(|| "cursor missing key".to_string())?;
        let id = parts.next().ok_or_else(|| "cursor missing id".to_string())?;
        Ok(Self {
            sort: DomainSort::from_str(sort)?,
            key: key.to_string(),
            id: Uuid::parse_str(id).map_err(|_| "cursor id is not a UUID".to_string())?,
        })
    }

    /// Bind the key with the sort column's type so SQLite compares
    /// numerics as numerics.
    fn key_param(&self) -> Result<Box<dyn rusqlite::ToSql>, StoreError> {
        match self.sort {
            DomainSort::OffsetAsc => {
                let key: i64 = self.key.parse().map_err(|_| {
                    StoreError::Other(anyhow::anyhow!("malformed cursor key: {}", self.key))
                })?;
                Ok(Box::new(key))
            }
            DomainSort::ScoreDesc | DomainSort::ScoreAsc => {
                let key: f64 = self.key.parse().map_err(|_| {
                    StoreError::Other(anyhow::anyhow!("malformed cursor key: {}", self.key))
                })?;
                Ok(Box::new(key))
            }
            DomainSort::LastHttpFetchedAtDesc => Ok(Box::new(self.key.clone())),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DomainFilters {
    pub dns_status: Option<DomainResultStatus>,
    pub http_status: Option<DomainResultStatus>,
    pub dns_reason: Option<String>,
    pub http_reason: Option<String>,
    pub min_score: Option<f64>,
    pub not_parked: bool,
    pub has_contact: bool,
    pub keyword: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DomainQuery {
    pub filters: DomainFilters,
    pub sort: DomainSort,
    pub limit: i64,
    pub offset: Option<i64>,
    pub cursor: Option<DomainCursor>,
}

impl Default for DomainQuery {
    fn default() -> Self {
        Self {
            filters: DomainFilters::default(),
            sort: DomainSort::OffsetAsc,
            limit: 100,
            offset: None,
            cursor: None,
        }
    }
}

#[derive(Debug)]
pub struct DomainPage {
    pub items: Vec<GeneratedDomain>,
    pub next_cursor: Option<String>,
}

impl CampaignStore {
    // ── Domain writes ─────────────────────────────────────────────────

    /// Insert a generated batch; `(offset_index, domain_name)` pairs.
    /// Conflicting rows (already-generated offsets or names) are skipped;
    /// the number of rows actually inserted is returned.
    pub fn insert_generated_domains(
        &self,
        campaign_id: Uuid,
        batch: &[(i64, String)],
    ) -> Result<usize, StoreError> {
        let now = Self::now();
        let mut inserted = 0;
        for (offset_index, domain_name) in batch {
            inserted += self.conn.execute(
                "INSERT OR IGNORE INTO generated_domains
                     (id, campaign_id, domain_name, offset_index, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    campaign_id.to_string(),
                    domain_name,
                    offset_index,
                    now
                ],
            )?;
        }
        Ok(inserted)
    }

    pub fn count_domains(&self, campaign_id: Uuid) -> Result<i64, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM generated_domains WHERE campaign_id = ?1",
            params![campaign_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Next work batch for a phase worker. Each phase consumes the output
    /// of the previous one, so the predicates chain.
    pub fn pending_domains_for_dns(
        &self,
        campaign_id: Uuid,
        limit: i64,
    ) -> Result<Vec<GeneratedDomain>, StoreError> {
        self.select_domains_where(campaign_id, "dns_status = 'pending'", limit)
    }

    pub fn pending_domains_for_http(
        &self,
        campaign_id: Uuid,
        limit: i64,
    ) -> Result<Vec<GeneratedDomain>, StoreError> {
        self.select_domains_where(
            campaign_id,
            "dns_status = 'ok' AND http_status = 'pending'",
            limit,
        )
    }

    pub fn pending_domains_for_enrichment(
        &self,
        campaign_id: Uuid,
        limit: i64,
    ) -> Result<Vec<GeneratedDomain>, StoreError> {
        self.select_domains_where(
            campaign_id,
            "http_status = 'ok' AND features IS NULL",
            limit,
        )
    }

    pub fn pending_domains_for_analysis(
        &self,
        campaign_id: Uuid,
        limit: i64,
    ) -> Result<Vec<GeneratedDomain>, StoreError> {
        self.select_domains_where(
            campaign_id,
            "http_status = 'ok' AND lead_status = 'pending'",
            limit,
        )
    }

    pub fn count_pending_for_dns(&self, campaign_id: Uuid) -> Result<i64, StoreError> {
        self.count_domains_where(campaign_id, "dns_status = 'pending'")
    }

    pub fn count_pending_for_http(&self, campaign_id: Uuid) -> Result<i64, StoreError> {
        self.count_domains_where(campaign_id, "dns_status = 'ok' AND http_status = 'pending'")
    }

    pub fn count_pending_for_enrichment(&self, campaign_id: Uuid) -> Result<i64, StoreError> {
        self.count_domains_where(campaign_id, "http_status = 'ok' AND features IS NULL")
    }

    pub fn count_pending_for_analysis(&self, campaign_id: Uuid) -> Result<i64, StoreError> {
        self.count_domains_where(campaign_id, "http_status = 'ok' AND lead_status = 'pending'")
    }

    fn count_domains_where(&self, campaign_id: Uuid, predicate: &str) -> Result<i64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) FROM generated_domains WHERE campaign_id = ?1 AND {}",
            predicate
        );
        let count = self
            .conn
            .query_row(&sql, params![campaign_id.to_string()], |row| row.get(0))?;
        Ok(count)
    }

    fn select_domains_where(
        &self,
        campaign_id: Uuid,
        predicate: &str,
        limit: i64,
    ) -> Result<Vec<GeneratedDomain>, StoreError> {
        let sql = format!(
            "SELECT {} FROM generated_domains
             WHERE campaign_id = ?1 AND {}
             ORDER BY offset_index LIMIT ?2",
            DOMAIN_COLUMNS, predicate
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![campaign_id.to_string(), limit], row_mapper)?;
        let mut domains = Vec::new();
        for row in rows {
            domains.push(row?.into_domain()?);
        }
        Ok(domains)
    }

    pub fn set_dns_result(
        &self,
        domain_id: Uuid,
        status: DomainResultStatus,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE generated_domains SET dns_status = ?1, dns_reason = ?2 WHERE id = ?3",
            params![status.as_str(), reason, domain_id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_http_result(
        &self,
        domain_id: Uuid,
        status: DomainResultStatus,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE generated_domains
             SET http_status = ?1, http_reason = ?2, last_http_fetched_at = ?3
             WHERE id = ?4",
            params![status.as_str(), reason, Self::now(), domain_id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_domain_features(
        &self,
        domain_id: Uuid,
        features: &Value,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE generated_domains SET features = ?1 WHERE id = ?2",
            params![features.to_string(), domain_id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_lead_result(
        &self,
        domain_id: Uuid,
        status: LeadStatus,
        score: Option<f64>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE generated_domains SET lead_status = ?1, domain_score = ?2 WHERE id = ?3",
            params![status.as_str(), score, domain_id.to_string()],
        )?;
        Ok(())
    }

    // ── Listing ───────────────────────────────────────────────────────

    pub fn list_domains(
        &self,
        campaign_id: Uuid,
        query: &DomainQuery,
    ) -> Result<DomainPage, StoreError> {
        let limit = query.limit.clamp(1, MAX_DOMAIN_PAGE);
        let mut sql = format!(
            "SELECT {} FROM generated_domains WHERE campaign_id = ?",
            DOMAIN_COLUMNS
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(campaign_id.to_string())];

        let f = &query.filters;
        if let Some(status) = f.dns_status {
            sql.push_str(" AND dns_status = ?");
            args.push(Box::new(status.as_str().to_string()));
        }
        if let Some(status) = f.http_status {
            sql.push_str(" AND http_status = ?");
            args.push(Box::new(status.as_str().to_string()));
        }
        if let Some(reason) = &f.dns_reason {
            sql.push_str(" AND dns_reason = ?");
            args.push(Box::new(reason.clone()));
        }
        if let Some(reason) = &f.http_reason {
            sql.push_str(" AND http_reason = ?");
            args.push(Box::new(reason.clone()));
        }
        if let Some(min_score) = f.min_score {
            sql.push_str(" AND domain_score >= ?");
            args.push(Box::new(min_score));
        }
        if f.not_parked {
            sql.push_str(" AND COALESCE(json_extract(features, '$.parked'), 0) = 0");
        }
        if f.has_contact {
            sql.push_str(" AND json_extract(features, '$.contact_email') IS NOT NULL");
        }
        if let Some(keyword) = &f.keyword {
            sql.push_str(" AND domain_name LIKE ?");
            args.push(Box::new(format!("%{}%", keyword.replace('%', ""))));
        }

        let key = query.sort.key_expr();
        if let Some(cursor) = &query.cursor {
            // Keyset predicate: strictly after the cursor row in sort order,
            // ties broken by id so pagination is stable under inserts. The
            // key binds with the column's affinity, not as text.
            let cmp = if query.sort.descending() { "<" } else { ">" };
            sql.push_str(&format!(
                " AND ({key} {cmp} ? OR ({key} = ? AND id > ?))",
                key = key,
                cmp = cmp
            ));
            args.push(cursor.key_param()?);
            args.push(cursor.key_param()?);
            args.push(Box::new(cursor.id.to_string()));
        }

        let direction = if query.sort.descending() { "DESC" } else { "ASC" };
        sql.push_str(&format!(" ORDER BY {} {}, id ASC LIMIT ?", key, direction));
        args.push(Box::new(limit));
        if query.cursor.is_none() {
            if let Some(offset) = query.offset {
                sql.push_str(" OFFSET ?");
                args.push(Box::new(offset.max(0)));
            }
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_mapper)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?.into_domain()?);
        }

        let next_cursor = if items.len() as i64 == limit {
            items.last().map(|last| {
                DomainCursor {
                    sort: query.sort,
                    key: query.sort.key_of(last),
                    id: last.id,
                }
                .encode()
            })
        } else {
            None
        };

        Ok(DomainPage { items, next_cursor })
    }

    // ── Read-only aggregation helpers ─────────────────────────────────

    /// Score classification buckets: high ≥ 0.7, medium ≥ 0.4, low below
    /// that, unscored for NULL scores.
    pub fn score_classification_buckets(
        &self,
        campaign_id: Uuid,
    ) -> Result<(i64, i64, i64, i64), StoreError> {
        let buckets = self.conn.query_row(
            "SELECT
                SUM(domain_score >= 0.7),
                SUM(domain_score >= 0.4 AND domain_score < 0.7),
                SUM(domain_score < 0.4),
                SUM(domain_score IS NULL)
             FROM generated_domains WHERE campaign_id = ?1",
            params![campaign_id.to_string()],
            |row| {
                let get = |i: usize| -> rusqlite::Result<i64> {
                    Ok(row.get::<_, Option<i64>>(i)?.unwrap_or(0))
                };
                Ok((get(0)?, get(1)?, get(2)?, get(3)?))
            },
        )?;
        Ok(buckets)
    }

    /// Domains created per hour, most recent first. Hour keys are the
    /// RFC 3339 prefix `YYYY-MM-DDTHH`.
    pub fn domains_created_per_hour(
        &self,
        campaign_id: Uuid,
        buckets: i64,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT substr(created_at, 1, 13) AS hour, COUNT(*)
             FROM generated_domains WHERE campaign_id = ?1
             GROUP BY hour ORDER BY hour DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![campaign_id.to_string(), buckets], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut histogram = Vec::new();
        for row in rows {
            histogram.push(row?);
        }
        Ok(histogram)
    }

    // ── Materialized counters ─────────────────────────────────────────

    /// Authoritative aggregation over `generated_domains`, computed in one
    /// read-consistent pass.
    pub fn aggregate_domain_counters(
        &self,
        campaign_id: Uuid,
    ) -> Result<DomainCounters, StoreError> {
        let campaign_version = self
            .conn
            .query_row(
                "SELECT version FROM campaign_state WHERE campaign_id = ?1",
                params![campaign_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let counters = self.conn.query_row(
            "SELECT
                COUNT(*),
                SUM(dns_status = 'pending'), SUM(dns_status = 'ok'),
                SUM(dns_status = 'error'), SUM(dns_status = 'timeout'),
                SUM(http_status = 'pending'), SUM(http_status = 'ok'),
                SUM(http_status = 'error'), SUM(http_status = 'timeout'),
                SUM(lead_status = 'pending'), SUM(lead_status = 'match'),
                SUM(lead_status = 'no_match'), SUM(lead_status = 'error'),
                SUM(lead_status = 'timeout')
             FROM generated_domains WHERE campaign_id = ?1",
            params![campaign_id.to_string()],
            |row| {
                let get = |i: usize| -> rusqlite::Result<i64> {
                    Ok(row.get::<_, Option<i64>>(i)?.unwrap_or(0))
                };
                Ok(DomainCounters {
                    campaign_id,
                    total: row.get(0)?,
                    dns: ResultBreakdown {
                        pending: get(1)?,
                        ok: get(2)?,
                        error: get(3)?,
                        timeout: get(4)?,
                    },
                    http: ResultBreakdown {
                        pending: get(5)?,
                        ok: get(6)?,
                        error: get(7)?,
                        timeout: get(8)?,
                    },
                    lead: LeadBreakdown {
                        pending: get(9)?,
                        matched: get(10)?,
                        no_match: get(11)?,
                        error: get(12)?,
                        timeout: get(13)?,
                    },
                    campaign_version,
                    updated_at: Self::now(),
                })
            },
        )?;
        Ok(counters)
    }

    pub fn get_domain_counters(
        &self,
        campaign_id: Uuid,
    ) -> Result<Option<DomainCounters>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT campaign_id, total,
                        dns_pending, dns_ok, dns_error, dns_timeout,
                        http_pending, http_ok, http_error, http_timeout,
                        lead_pending, lead_match, lead_no_match, lead_error, lead_timeout,
                        campaign_version, updated_at
                 FROM campaign_domain_counters WHERE campaign_id = ?1",
                params![campaign_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        [
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, i64>(7)?,
                            row.get::<_, i64>(8)?,
                            row.get::<_, i64>(9)?,
                            row.get::<_, i64>(10)?,
                            row.get::<_, i64>(11)?,
                            row.get::<_, i64>(12)?,
                            row.get::<_, i64>(13)?,
                            row.get::<_, i64>(14)?,
                        ],
                        row.get::<_, i64>(15)?,
                        row.get::<_, String>(16)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, total, buckets, campaign_version, updated_at)| {
            Ok(DomainCounters {
                campaign_id: parse_uuid(&id)?,
                total,
                dns: ResultBreakdown {
                    pending: buckets[0],
                    ok: buckets[1],
                    error: buckets[2],
                    timeout: buckets[3],
                },
                http: ResultBreakdown {
                    pending: buckets[4],
                    ok: buckets[5],
                    error: buckets[6],
                    timeout: buckets[7],
                },
                lead: LeadBreakdown {
                    pending: buckets[8],
                    matched: buckets[9],
                    no_match: buckets[10],
                    error: buckets[11],
                    timeout: buckets[12],
                },
                campaign_version,
                updated_at,
            })
        })
        .transpose()
    }

    pub fn upsert_domain_counters(&self, counters: &DomainCounters) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO campaign_domain_counters
                 (campaign_id, total,
                  dns_pending, dns_ok, dns_error, dns_timeout,
                  http_pending, http_ok, http_error, http_timeout,
                  lead_pending, lead_match, lead_no_match, lead_error, lead_timeout,
                  campaign_version, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT(campaign_id) DO UPDATE SET
                 total = ?2,
                 dns_pending = ?3, dns_ok = ?4, dns_error = ?5, dns_timeout = ?6,
                 http_pending = ?7, http_ok = ?8, http_error = ?9, http_timeout = ?10,
                 lead_pending = ?11, lead_match = ?12, lead_no_match = ?13,
                 lead_error = ?14, lead_timeout = ?15,
                 campaign_version = ?16, updated_at = ?17",
            params![
                counters.campaign_id.to_string(),
                counters.total,
                counters.dns.pending,
                counters.dns.ok,
                counters.dns.error,
                counters.dns.timeout,
                counters.http.pending,
                counters.http.ok,
                counters.http.error,
                counters.http.timeout,
                counters.lead.pending,
                counters.lead.matched,
                counters.lead.no_match,
                counters.lead.error,
                counters.lead.timeout,
                counters.campaign_version,
                counters.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn delete_domain_counters(&self, campaign_id: Uuid) -> Result<bool, StoreError> {
        let count = self.conn.execute(
            "DELETE FROM campaign_domain_counters WHERE campaign_id = ?1",
            params![campaign_id.to_string()],
        )?;
        Ok(count > 0)
    }

    /// Best-effort increment from a worker; a missing row is left missing
    /// (rebuild-on-miss owns that case).
    pub fn bump_domain_counters(
        &self,
        campaign_id: Uuid,
        deltas: &[(CounterColumn, i64)],
    ) -> Result<(), StoreError> {
        for (column, delta) in deltas {
            let sql = format!(
                "UPDATE campaign_domain_counters
                 SET {col} = MAX(0, {col} + ?1), updated_at = ?2
                 WHERE campaign_id = ?3",
                col = column.as_str()
            );
            self.conn.execute(
                &sql,
                params![delta, Self::now(), campaign_id.to_string()],
            )?;
        }
        Ok(())
    }

    /// Campaigns whose counters look stale: not touched within the drift
    /// window, or written against an older campaign-state version.
    pub fn campaigns_with_stale_counters(
        &self,
        drift_window_secs: i64,
    ) -> Result<Vec<Uuid>, StoreError> {
        let cutoff =
            (chrono::Utc::now() - chrono::Duration::seconds(drift_window_secs)).to_rfc3339();
        let mut stmt = self.conn.prepare(
            "SELECT c.campaign_id FROM campaign_domain_counters c
             JOIN campaign_state s ON s.campaign_id = c.campaign_id
             WHERE c.updated_at < ?1 OR c.campaign_version <> s.version",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(parse_uuid(&row?)?);
        }
        Ok(ids)
    }
}

/// Column selector for best-effort counter bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterColumn {
    Total,
    DnsPending,
    DnsOk,
    DnsError,
    DnsTimeout,
    HttpPending,
    HttpOk,
    HttpError,
    HttpTimeout,
    LeadPending,
    LeadMatch,
    LeadNoMatch,
    LeadError,
    LeadTimeout,
}

impl CounterColumn {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::DnsPending => "dns_pending",
            Self::DnsOk => "dns_ok",
            Self::DnsError => "dns_error",
            Self::DnsTimeout => "dns_timeout",
            Self::HttpPending => "http_pending",
            Self::HttpOk => "http_ok",
            Self::HttpError => "http_error",
            Self::HttpTimeout => "http_timeout",
            Self::LeadPending => "lead_pending",
            Self::LeadMatch => "lead_match",
            Self::LeadNoMatch => "lead_no_match",
            Self::LeadError => "lead_error",
            Self::LeadTimeout => "lead_timeout",
        }
    }

    pub fn for_dns(status: DomainResultStatus) -> Self {
        match status {
            DomainResultStatus::Pending => Self::DnsPending,
            DomainResultStatus::Ok => Self::DnsOk,
            DomainResultStatus::Error => Self::DnsError,
            DomainResultStatus::Timeout => Self::DnsTimeout,
        }
    }

    pub fn for_http(status: DomainResultStatus) -> Self {
        match status {
            DomainResultStatus::Pending => Self::HttpPending,
            DomainResultStatus::Ok => Self::HttpOk,
            DomainResultStatus::Error => Self::HttpError,
            DomainResultStatus::Timeout => Self::HttpTimeout,
        }
    }

    pub fn for_lead(status: LeadStatus) -> Self {
        match status {
            LeadStatus::Pending => Self::LeadPending,
            LeadStatus::Match => Self::LeadMatch,
            LeadStatus::NoMatch => Self::LeadNoMatch,
            LeadStatus::Error => Self::LeadError,
            LeadStatus::Timeout => Self::LeadTimeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::CampaignMode;
    use crate::store::seed_executions;
    use serde_json::json;

    fn fixture(store: &CampaignStore) -> Uuid {
        let campaign = store
            .create_campaign(Uuid::new_v4(), "domains-test", None, &json!({}))
            .unwrap();
        store
            .create_campaign_state(campaign.id, CampaignMode::StepByStep, &json!({}))
            .unwrap();
        seed_executions(store, campaign.id).unwrap();
        campaign.id
    }

    fn insert_numbered(store: &CampaignStore, campaign_id: Uuid, count: i64) {
        let batch: Vec<(i64, String)> = (0..count)
            .map(|i| (i, format!("site{:04}.com", i)))
            .collect();
        assert_eq!(
            store
                .insert_generated_domains(campaign_id, &batch)
                .unwrap(),
            count as usize
        );
    }

    #[test]
    fn test_insert_skips_conflicting_offsets() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign_id = fixture(&store);
        insert_numbered(&store, campaign_id, 3);
        // Same offsets again: all skipped.
        let batch: Vec<(i64, String)> =
            (0..3).map(|i| (i, format!("other{}.com", i))).collect();
        assert_eq!(
            store.insert_generated_domains(campaign_id, &batch).unwrap(),
            0
        );
        assert_eq!(store.count_domains(campaign_id).unwrap(), 3);
    }

    #[test]
    fn test_pending_feeds_chain_per_phase() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign_id = fixture(&store);
        insert_numbered(&store, campaign_id, 4);

        let dns_batch = store.pending_domains_for_dns(campaign_id, 10).unwrap();
        assert_eq!(dns_batch.len(), 4);

        // Resolve two ok, one error; http work is only the ok ones.
        store
            .set_dns_result(dns_batch[0].id, DomainResultStatus::Ok, None)
            .unwrap();
        store
            .set_dns_result(dns_batch[1].id, DomainResultStatus::Ok, None)
            .unwrap();
        store
            .set_dns_result(dns_batch[2].id, DomainResultStatus::Error, Some("NXDOMAIN"))
            .unwrap();

        assert_eq!(store.pending_domains_for_dns(campaign_id, 10).unwrap().len(), 1);
        let http_batch = store.pending_domains_for_http(campaign_id, 10).unwrap();
        assert_eq!(http_batch.len(), 2);

        store
            .set_http_result(http_batch[0].id, DomainResultStatus::Ok, None)
            .unwrap();
        assert_eq!(
            store
                .pending_domains_for_analysis(campaign_id, 10)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            store
                .pending_domains_for_enrichment(campaign_id, 10)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_list_filters_and_clamps_limit() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign_id = fixture(&store);
        insert_numbered(&store, campaign_id, 5);
        let all = store
            .list_domains(campaign_id, &DomainQuery::default())
            .unwrap();
        assert_eq!(all.items.len(), 5);

        let page = store
            .list_domains(
                campaign_id,
                &DomainQuery {
                    limit: 5000,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.items.len(), 5); // clamp only caps, table has 5

        let keyword = store
            .list_domains(
                campaign_id,
                &DomainQuery {
                    filters: DomainFilters {
                        keyword: Some("site0003".into()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(keyword.items.len(), 1);
        assert_eq!(keyword.items[0].domain_name, "site0003.com");
    }

    #[test]
    fn test_cursor_pagination_is_stable_under_inserts() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign_id = fixture(&store);
        insert_numbered(&store, campaign_id, 6);

        let first = store
            .list_domains(
                campaign_id,
                &DomainQuery {
                    limit: 3,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(first.items.len(), 3);
        let cursor = DomainCursor::decode(first.next_cursor.as_deref().unwrap()).unwrap();

        // Concurrent insert before the cursor position must not shift the page.
        store
            .insert_generated_domains(campaign_id, &[(100, "late-arrival.com".into())])
            .unwrap();

        let second = store
            .list_domains(
                campaign_id,
                &DomainQuery {
                    limit: 3,
                    cursor: Some(cursor.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        let offsets: Vec<i64> = second.items.iter().map(|d| d.offset_index).collect();
        assert_eq!(offsets, vec![3, 4, 5]);

        // Same cursor, same items.
        let again = store
            .list_domains(
                campaign_id,
                &DomainQuery {
                    limit: 3,
                    cursor: Some(cursor),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(
            again.items.iter().map(|d| d.id).collect::<Vec<_>>(),
            second.items.iter().map(|d| d.id).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_score_sort_descending_with_nulls_last() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign_id = fixture(&store);
        insert_numbered(&store, campaign_id, 3);
        let domains = store
            .list_domains(campaign_id, &DomainQuery::default())
            .unwrap()
            .items;
        store
            .set_lead_result(domains[0].id, LeadStatus::Match, Some(0.4))
            .unwrap();
        store
            .set_lead_result(domains[1].id, LeadStatus::Match, Some(0.9))
            .unwrap();
        // domains[2] keeps a NULL score.

        let sorted = store
            .list_domains(
                campaign_id,
                &DomainQuery {
                    sort: DomainSort::ScoreDesc,
                    ..Default::default()
                },
            )
            .unwrap();
        let scores: Vec<Option<f64>> =
            sorted.items.iter().map(|d| d.domain_score).collect();
        assert_eq!(scores, vec![Some(0.9), Some(0.4), None]);
    }

    #[test]
    fn test_cursor_round_trip_and_rejects_garbage() {
        let cursor = DomainCursor {
            sort: DomainSort::ScoreDesc,
            key: "0.75".into(),
            id: Uuid::new_v4(),
        };
        assert_eq!(DomainCursor::decode(&cursor.encode()).unwrap(), cursor);
        assert!(DomainCursor::decode("nonsense").is_err());
        assert!(DomainCursor::decode("score_desc~0.5~not-a-uuid").is_err());
    }

    #[test]
    fn test_counters_aggregate_matches_rows() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign_id = fixture(&store);
        insert_numbered(&store, campaign_id, 10);
        let domains = store
            .list_domains(campaign_id, &DomainQuery::default())
            .unwrap()
            .items;
        for domain in &domains[..4] {
            store
                .set_dns_result(domain.id, DomainResultStatus::Ok, None)
                .unwrap();
        }
        for domain in &domains[4..9] {
            store
                .set_dns_result(domain.id, DomainResultStatus::Error, Some("SERVFAIL"))
                .unwrap();
        }

        let counters = store.aggregate_domain_counters(campaign_id).unwrap();
        assert_eq!(counters.total, 10);
        assert_eq!(counters.dns.ok, 4);
        assert_eq!(counters.dns.error, 5);
        assert_eq!(counters.dns.pending, 1);
        assert_eq!(counters.dns.timeout, 0);
        assert_eq!(counters.lead.pending, 10);

        store.upsert_domain_counters(&counters).unwrap();
        let stored = store.get_domain_counters(campaign_id).unwrap().unwrap();
        assert!(stored.same_counts(&counters));
    }

    #[test]
    fn test_counter_bumps_are_best_effort() {
        let store = CampaignStore::in_memory().unwrap();
        let campaign_id = fixture(&store);
        // No counters row yet: bump is a silent no-op.
        store
            .bump_domain_counters(campaign_id, &[(CounterColumn::Total, 3)])
            .unwrap();
        assert!(store.get_domain_counters(campaign_id).unwrap().is_none());

        let counters = store.aggregate_domain_counters(campaign_id).unwrap();
        store.upsert_domain_counters(&counters).unwrap();
        store
            .bump_domain_counters(
                campaign_id,
                &[(CounterColumn::Total, 2), (CounterColumn::DnsPending, 2)],
            )
            .unwrap();
        let stored = store.get_domain_counters(campaign_id).unwrap().unwrap();
        assert_eq!(stored.total, 2);
        assert_eq!(stored.dns.pending, 2);
    }
}
