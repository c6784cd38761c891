//! Builds the parameterized SQL statements the cache engine executes.
//!
//! A [`SqlCommands`] is derived once from a `schema`/`table` pair (and
//! rebuilt only if those change — see the "reactive reconfiguration" design
//! note; there is no per-statement mutation). Every *value* that varies
//! per-call is a bound parameter; only validated identifiers are spliced
//! into the statement text.

use crate::config::CacheConfig;

/// Quotes a Postgres identifier, doubling any embedded quote characters.
/// Called only on identifiers that have already passed
/// [`crate::config::GlacialCacheConfig::validate`], but kept defensive since
/// `SqlCommands` may be constructed directly in tests.
pub fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// The SQL fragment computing the next-expiration instant from two bound
/// parameters (`$abs_param` / `$sliding_param`, already `::timestamptz` /
/// `::interval`-cast) and a third bound default-interval parameter
/// (`$default_param`). Used by `Set`/`SetMultiple`, where the prior state of
/// the row (if any) is irrelevant — the new values entirely determine the
/// next expiration.
fn next_expiration_from_params(abs_param: &str, sliding_param: &str, default_param: &str) -> String {
    format!(
        "CASE \
         WHEN {abs}::timestamptz IS NOT NULL AND {sliding}::interval IS NULL THEN {abs}::timestamptz \
         WHEN {abs}::timestamptz IS NOT NULL AND {sliding}::interval IS NOT NULL THEN LEAST(now() + {sliding}::interval, {abs}::timestamptz) \
         WHEN {abs}::timestamptz IS NULL AND {sliding}::interval IS NOT NULL THEN now() + {sliding}::interval \
         ELSE now() + {default}::interval \
         END",
        abs = abs_param,
        sliding = sliding_param,
        default = default_param,
    )
}

/// The SQL fragment renewing `next_expiration` from the row's *own*
/// `absolute_expiration`/`sliding_interval` columns plus a bound default
/// interval. Used by `Get`/`Refresh`, which renew an existing row in place.
fn next_expiration_from_columns(default_param: &str) -> String {
    format!(
        "CASE \
         WHEN absolute_expiration IS NOT NULL AND sliding_interval IS NULL THEN absolute_expiration \
         WHEN absolute_expiration IS NOT NULL AND sliding_interval IS NOT NULL THEN LEAST(now() + sliding_interval, absolute_expiration) \
         WHEN absolute_expiration IS NULL AND sliding_interval IS NOT NULL THEN now() + sliding_interval \
         ELSE now() + {default}::interval \
         END",
        default = default_param,
    )
}

/// Precomputed statement text for every fixed-shape operation against one
/// `schema.table`. `SetMultiple` is built on demand per batch size by
/// [`SqlCommands::set_multiple_sql`] since its row count varies per call.
#[derive(Debug, Clone)]
pub struct SqlCommands {
    qualified_table: String,
    pub get: String,
    pub get_value_only: String,
    pub get_multiple: String,
    pub set: String,
    pub remove: String,
    pub remove_multiple: String,
    pub refresh: String,
    pub refresh_multiple: String,
    pub cleanup_expired: String,
}

impl SqlCommands {
    /// Builds the full set of statements for `schema.table`. `schema` and
    /// `table` are assumed already validated (see
    /// [`crate::config::GlacialCacheConfig::validate`]).
    #[must_use]
    pub fn new(schema: &str, table: &str) -> Self {
        let qualified_table = format!("{}.{}", quote_ident(schema), quote_ident(table));
        let renew_from_columns = next_expiration_from_columns("$2");
        let renew_from_params = next_expiration_from_params("$3", "$4", "$5");

        let get = format!(
            "UPDATE {t} SET next_expiration = {renew} \
             WHERE key = $1 AND next_expiration > now() \
             RETURNING value, absolute_expiration, sliding_interval, value_type, value_size, next_expiration",
            t = qualified_table,
            renew = renew_from_columns,
        );

        let get_value_only = format!(
            "UPDATE {t} SET next_expiration = {renew} \
             WHERE key = $1 AND next_expiration > now() \
             RETURNING value",
            t = qualified_table,
            renew = renew_from_columns,
        );

        let get_multiple = format!(
            "UPDATE {t} SET next_expiration = {renew} \
             WHERE key = ANY($1) AND next_expiration > now() \
             RETURNING key, value, absolute_expiration, sliding_interval, value_type, value_size, next_expiration",
            t = qualified_table,
            renew = renew_from_columns,
        );

        let set = format!(
            "INSERT INTO {t} (key, value, absolute_expiration, sliding_interval, next_expiration, value_type, value_size) \
             VALUES ($1, $2, $3, $4, {renew}, $6, $7) \
             ON CONFLICT (key) DO UPDATE SET \
               value = EXCLUDED.value, \
               absolute_expiration = EXCLUDED.absolute_expiration, \
               sliding_interval = EXCLUDED.sliding_interval, \
               next_expiration = EXCLUDED.next_expiration, \
               value_type = EXCLUDED.value_type, \
               value_size = EXCLUDED.value_size",
            t = qualified_table,
            renew = renew_from_params,
        );

        let remove = format!("DELETE FROM {t} WHERE key = $1", t = qualified_table);
        let remove_multiple = format!(
            "DELETE FROM {t} WHERE key = ANY($1)",
            t = qualified_table
        );

        let refresh = format!(
            "UPDATE {t} SET next_expiration = {renew} \
             WHERE key = $1 AND sliding_interval IS NOT NULL AND next_expiration > now()",
            t = qualified_table,
            renew = renew_from_columns,
        );

        let refresh_multiple = format!(
            "UPDATE {t} SET next_expiration = {renew} \
             WHERE key = ANY($1) AND sliding_interval IS NOT NULL AND next_expiration > now()",
            t = qualified_table,
            renew = renew_from_columns,
        );

        let cleanup_expired = format!(
            "WITH victims AS ( \
               SELECT ctid FROM {t} WHERE next_expiration <= $1 LIMIT $2 \
             ) \
             DELETE FROM {t} WHERE ctid IN (SELECT ctid FROM victims)",
            t = qualified_table,
        );

        Self {
            qualified_table,
            get,
            get_value_only,
            get_multiple,
            set,
            remove,
            remove_multiple,
            refresh,
            refresh_multiple,
            cleanup_expired,
        }
    }

    #[must_use]
    pub fn from_cache_config(cache_config: &CacheConfig) -> Self {
        Self::new(&cache_config.schema_name, &cache_config.table_name)
    }

    #[must_use]
    pub fn qualified_table(&self) -> &str {
        &self.qualified_table
    }

    /// Builds a multi-row `INSERT ... VALUES (...), (...), ... ON CONFLICT`
    /// statement for exactly `count` entries. Each row consumes 7 bind
    /// parameters in order `(key, value, absolute_expiration,
    /// sliding_interval, <next_expiration expr>, value_type, value_size)`.
    /// Called with `count` already clamped to the configured
    /// `max_batch_size` by the cache engine's chunking.
    #[must_use]
    pub fn set_multiple_sql(&self, count: usize) -> String {
        debug_assert!(count > 0, "set_multiple_sql requires at least one row");
        let mut values = String::new();
        for i in 0..count {
            // 7 placeholders per row: key, value, absolute_expiration,
            // sliding_interval, default_interval, value_type, value_size.
            let base = i * 7;
            let key = base + 1;
            let value = base + 2;
            let abs = base + 3;
            let sliding = base + 4;
            let default_interval = base + 5;
            if i > 0 {
                values.push_str(", ");
            }
            values.push('(');
            values.push_str(&format!("${key}, ${value}, ${abs}, ${sliding}, "));
            values.push_str(&next_expiration_from_params(
                &format!("${abs}"),
                &format!("${sliding}"),
                &format!("${default_interval}"),
            ));
            values.push_str(&format!(", ${}, ${}", base + 6, base + 7));
            values.push(')');
        }

        format!(
            "INSERT INTO {t} (key, value, absolute_expiration, sliding_interval, next_expiration, value_type, value_size) \
             VALUES {values} \
             ON CONFLICT (key) DO UPDATE SET \
               value = EXCLUDED.value, \
               absolute_expiration = EXCLUDED.absolute_expiration, \
               sliding_interval = EXCLUDED.sliding_interval, \
               next_expiration = EXCLUDED.next_expiration, \
               value_type = EXCLUDED.value_type, \
               value_size = EXCLUDED.value_size",
            t = self.qualified_table,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_wraps_in_double_quotes() {
        assert_eq!(quote_ident("glacial_cache"), "\"glacial_cache\"");
    }

    #[test]
    fn quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }

    #[test]
    fn qualified_table_is_schema_dot_table_quoted() {
        let commands = SqlCommands::new("public", "glacial_cache");
        assert_eq!(commands.qualified_table(), "\"public\".\"glacial_cache\"");
    }

    #[test]
    fn get_statement_renews_from_row_columns_and_is_conditioned_on_liveness() {
        let commands = SqlCommands::new("public", "glacial_cache");
        assert!(commands.get.contains("next_expiration > now()"));
        assert!(commands.get.contains("RETURNING value, absolute_expiration"));
        assert!(commands.get.contains("WHERE key = $1"));
    }

    #[test]
    fn set_statement_upserts_on_conflict() {
        let commands = SqlCommands::new("public", "glacial_cache");
        assert!(commands.set.contains("ON CONFLICT (key) DO UPDATE"));
        assert!(commands.set.contains("INSERT INTO"));
    }

    #[test]
    fn refresh_requires_sliding_interval_and_liveness() {
        let commands = SqlCommands::new("public", "glacial_cache");
        assert!(commands.refresh.contains("sliding_interval IS NOT NULL"));
        assert!(commands.refresh.contains("next_expiration > now()"));
    }

    #[test]
    fn batch_statements_use_any_array_parameter() {
        let commands = SqlCommands::new("public", "glacial_cache");
        assert!(commands.get_multiple.contains("key = ANY($1)"));
        assert!(commands.remove_multiple.contains("key = ANY($1)"));
        assert!(commands.refresh_multiple.contains("key = ANY($1)"));
    }

    #[test]
    fn cleanup_uses_ctid_cte_because_delete_disallows_limit_directly() {
        let commands = SqlCommands::new("public", "glacial_cache");
        assert!(commands.cleanup_expired.starts_with("WITH victims AS"));
        assert!(commands.cleanup_expired.contains("LIMIT $2"));
        assert!(commands.cleanup_expired.contains("ctid IN"));
    }

    #[test]
    fn set_multiple_sql_generates_one_values_group_per_row() {
        let commands = SqlCommands::new("public", "glacial_cache");
        let sql = commands.set_multiple_sql(3);
        assert_eq!(sql.matches("VALUES").count(), 1);
        // 3 rows * 7 params/row = 21 distinct placeholders.
        for n in 1..=21 {
            assert!(sql.contains(&format!("${n}")), "missing placeholder ${n} in {sql}");
        }
    }

    #[test]
    fn set_multiple_sql_rows_are_independent_placeholders() {
        let commands = SqlCommands::new("public", "glacial_cache");
        let one_row = commands.set_multiple_sql(1);
        let two_rows = commands.set_multiple_sql(2);
        assert!(!one_row.contains("$8"));
        assert!(two_rows.contains("$8"));
    }
}
