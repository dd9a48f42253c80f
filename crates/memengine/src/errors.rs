use nativesrv::errors::{ExecError, codes};

pub type Result<T, E = MemEngineError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum MemEngineError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Table {0} doesn't exist")]
    UnknownTable(String),

    #[error("Table {0} already exists")]
    TableExists(String),

    #[error("Database {0} doesn't exist")]
    UnknownDatabase(String),

    #[error("Database {0} already exists")]
    DatabaseExists(String),

    #[error("Too many parts ({parts}). Maximum allowed parts per table is {limit}")]
    TooManyParts { parts: usize, limit: usize },

    #[error("Cannot parse input: {0}")]
    Parse(String),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl From<MemEngineError> for ExecError {
    fn from(e: MemEngineError) -> Self {
        let code = match &e {
            MemEngineError::Syntax(_) => codes::SYNTAX_ERROR,
            MemEngineError::UnknownTable(_) => codes::UNKNOWN_TABLE,
            MemEngineError::TableExists(_) => codes::TABLE_ALREADY_EXISTS,
            MemEngineError::UnknownDatabase(_) => codes::UNKNOWN_DATABASE,
            MemEngineError::DatabaseExists(_) => codes::DATABASE_ALREADY_EXISTS,
            MemEngineError::TooManyParts { parts, limit } => {
                return ExecError::too_many_parts(*parts, *limit);
            }
            MemEngineError::Parse(_) => codes::CANNOT_PARSE_INPUT,
            MemEngineError::Exec(e) => return e.clone(),
        };
        ExecError::new(code, e.to_string())
    }
}
