use sqlx::error::DatabaseError;
use sqlx::mysql::MySqlDatabaseError;

use crate::collector::CollectionError;
use crate::snapshot::{Scope, Section};

/// What a failed query means for the collection as a whole.
#[derive(Debug)]
pub enum Disposition {
    /// Abort the collection with this error.
    Abort(CollectionError),
    /// The account lacks a grant on the queried object.
    Denied(String),
    /// Record the section as missing and carry on.
    SkipSection(String),
}

impl Disposition {
    /// Settles a denied grant for one section: required sections abort the
    /// collection, optional ones are recorded as missing.
    pub fn in_section(self, section: Section) -> Disposition {
        match self {
            Disposition::Denied(message) if section.is_required() => {
                Disposition::Abort(CollectionError::PermissionDenied(message))
            }
            Disposition::Denied(message) => {
                Disposition::SkipSection(format!("permission denied: {message}"))
            }
            other => other,
        }
    }
}

/// Server error numbers for a dropped session.
const CONNECTION_ERRORS: &[u16] = &[1053, 2006, 2013];

/// The server refused the account or its default database outright.
const SESSION_REFUSED: &[u16] = &[1044, 1045];

/// Missing grants on a table, column or privilege.
const GRANT_ERRORS: &[u16] = &[1142, 1143, 1227, 1370];

pub fn mysql_error_number(error: &dyn DatabaseError) -> Option<u16> {
    error
        .try_downcast_ref::<MySqlDatabaseError>()
        .map(MySqlDatabaseError::number)
}

pub fn classify(error: &sqlx::Error) -> Disposition {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            Disposition::Abort(CollectionError::ConnectionLost(error.to_string()))
        }
        sqlx::Error::Database(db_err) => {
            classify_server_error(mysql_error_number(db_err.as_ref()), db_err.message())
        }
        other => Disposition::SkipSection(other.to_string()),
    }
}

fn classify_server_error(number: Option<u16>, message: &str) -> Disposition {
    match number {
        Some(n) if CONNECTION_ERRORS.contains(&n) => {
            Disposition::Abort(CollectionError::ConnectionLost(message.to_string()))
        }
        Some(n) if SESSION_REFUSED.contains(&n) => {
            Disposition::Abort(CollectionError::PermissionDenied(message.to_string()))
        }
        Some(n) if GRANT_ERRORS.contains(&n) => Disposition::Denied(message.to_string()),
        _ => Disposition::SkipSection(message.to_string()),
    }
}

/// Classification for failures outside a section (acquiring the session).
pub fn classify_session(error: sqlx::Error) -> CollectionError {
    match classify(&error) {
        Disposition::Abort(err) => err,
        Disposition::Denied(message) => CollectionError::PermissionDenied(message),
        Disposition::SkipSection(message) => CollectionError::ConnectionLost(message),
    }
}

/// Binds the `(schema, schema, tables, tables, limit)` parameters shared by
/// every scoped catalog query.
pub fn scoped<'q>(
    sql: &'q str,
    scope: &Scope,
    limit: u32,
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    let schema = scope.schema_filter();
    let tables = scope.tables_filter();
    sqlx::query(sql)
        .bind(schema.clone())
        .bind(schema)
        .bind(tables.clone())
        .bind(tables)
        .bind(i64::from(limit))
}

pub fn split_columns(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_abort_as_connection_lost() {
        for error in [sqlx::Error::PoolTimedOut, sqlx::Error::PoolClosed] {
            match classify(&error) {
                Disposition::Abort(CollectionError::ConnectionLost(_)) => {}
                other => panic!("unexpected disposition {other:?}"),
            }
        }
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(matches!(
            classify(&io),
            Disposition::Abort(CollectionError::ConnectionLost(_))
        ));
    }

    #[test]
    fn decode_problems_only_skip_the_section() {
        let error = sqlx::Error::ColumnNotFound("size_bytes".into());
        assert!(matches!(classify(&error), Disposition::SkipSection(_)));
    }

    #[test]
    fn denied_grants_only_abort_required_sections() {
        let denied = || classify_server_error(Some(1142), "SELECT command denied to user");

        for section in [Section::Tables, Section::Indexes] {
            assert!(matches!(
                denied().in_section(section),
                Disposition::Abort(CollectionError::PermissionDenied(_))
            ));
        }
        for section in [
            Section::IndexUsage,
            Section::IndexSizes,
            Section::Digests,
            Section::GlobalVariables,
        ] {
            match denied().in_section(section) {
                Disposition::SkipSection(reason) => assert!(reason.starts_with("permission denied")),
                other => panic!("unexpected disposition {other:?} for {section:?}"),
            }
        }
        assert!(matches!(
            classify_server_error(Some(1143), "column denied").in_section(Section::Columns),
            Disposition::SkipSection(_)
        ));
    }

    #[test]
    fn refused_session_aborts_everywhere() {
        assert!(matches!(
            classify_server_error(Some(1045), "Access denied for user").in_section(Section::Digests),
            Disposition::Abort(CollectionError::PermissionDenied(_))
        ));
        assert!(matches!(
            classify_server_error(Some(2013), "Lost connection").in_section(Section::Digests),
            Disposition::Abort(CollectionError::ConnectionLost(_))
        ));
    }

    #[test]
    fn splits_grouped_column_lists() {
        assert_eq!(split_columns("a, b,,c"), vec!["a", "b", "c"]);
        assert!(split_columns("").is_empty());
    }
}
