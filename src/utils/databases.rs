// Databases that are never recreated from a backup
pub const SYSTEM_DATABASES: &[&str] = &["system", "information_schema", "INFORMATION_SCHEMA"];

pub const DEFAULT_SKIP_TABLES: &[&str] = &["system.*", "INFORMATION_SCHEMA.*", "information_schema.*"];

pub fn is_information_schema(database: &str) -> bool {
    database.eq_ignore_ascii_case("information_schema")
}

pub fn is_system_database(database: &str) -> bool {
    SYSTEM_DATABASES.contains(&database)
}
