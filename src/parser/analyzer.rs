use sqlparser::ast::{
    BinaryOperator, Expr, Query, SetExpr, Statement, TableFactor, TableWithJoins, UnaryOperator,
    Value,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use super::classifier::{classify, CommandKind};
use super::placeholder::escape_placeholders;

/// Routing-relevant facts about a query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryAnalysis {
    /// Type of SQL statement
    pub stmt_type: StatementType,
    /// Tables referenced in the query
    pub tables: Vec<String>,
    /// Extracted shard key values (column_name -> values)
    pub shard_keys: Vec<(String, ShardKeyValue)>,
    /// Whether this is a read-only query
    pub is_read_only: bool,
    /// Whether the backend may answer with a result set
    pub returns_rows: bool,
}

impl QueryAnalysis {
    fn of(stmt_type: StatementType) -> Self {
        Self {
            stmt_type,
            tables: vec![],
            shard_keys: vec![],
            is_read_only: stmt_type.is_read_only(),
            returns_rows: stmt_type.returns_rows(),
        }
    }

    /// Columns compared against a parameter marker
    pub fn parameter_columns(&self) -> Vec<&str> {
        self.shard_keys
            .iter()
            .filter(|(_, v)| matches!(v, ShardKeyValue::Parameter))
            .map(|(c, _)| c.as_str())
            .collect()
    }
}

/// Type of SQL statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
    Begin,
    Commit,
    Rollback,
    Set,
    Show,
    Use,
    Call,
    Other,
}

impl StatementType {
    pub fn is_read_only(&self) -> bool {
        matches!(self, StatementType::Select | StatementType::Show)
    }

    /// Statements answered with rows; CALL may produce a result set
    /// without being read-only
    pub fn returns_rows(&self) -> bool {
        matches!(
            self,
            StatementType::Select | StatementType::Show | StatementType::Call
        )
    }

    pub fn is_transaction_control(&self) -> bool {
        matches!(
            self,
            StatementType::Begin | StatementType::Commit | StatementType::Rollback
        )
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            StatementType::Insert | StatementType::Update | StatementType::Delete
        )
    }
}

/// Shard key value extracted from SQL
#[derive(Debug, Clone, PartialEq)]
pub enum ShardKeyValue {
    /// Single value (e.g., user_id = 123)
    Single(i64),
    /// Multiple values (e.g., user_id IN (1, 2, 3))
    Multiple(Vec<i64>),
    /// Range (e.g., user_id BETWEEN 1 AND 100)
    Range { start: i64, end: i64 },
    /// Bound at execute time (e.g., user_id = ?)
    Parameter,
}

/// SQL Analyzer
pub struct SqlAnalyzer {
    dialect: MySqlDialect,
}

impl SqlAnalyzer {
    pub fn new() -> Self {
        Self {
            dialect: MySqlDialect {},
        }
    }

    /// Parse and analyze SQL
    ///
    /// Bare `?` markers are escaped first; a marker compared with a column
    /// shows up as `ShardKeyValue::Parameter`.
    pub fn analyze(&self, sql: &str) -> Result<QueryAnalysis, AnalyzerError> {
        let sql_trimmed = sql.trim();

        match classify(sql_trimmed) {
            CommandKind::BeginTransaction => return Ok(QueryAnalysis::of(StatementType::Begin)),
            CommandKind::Commit => return Ok(QueryAnalysis::of(StatementType::Commit)),
            CommandKind::Rollback => return Ok(QueryAnalysis::of(StatementType::Rollback)),
            _ => {}
        }

        let escaped = escape_placeholders(sql_trimmed);
        let statements = Parser::parse_sql(&self.dialect, &escaped)
            .map_err(|e| AnalyzerError::ParseError(e.to_string()))?;

        let stmt = statements.first().ok_or(AnalyzerError::EmptyStatement)?;
        let analysis = self.analyze_statement(stmt);
        if analysis.stmt_type == StatementType::Other {
            // Statements the AST has no dedicated arm for keep their keyword type
            return Ok(QueryAnalysis::of(keyword_statement_type(sql_trimmed)));
        }
        Ok(analysis)
    }

    /// Analyze, falling back to a keyword guess when the parser gives up
    ///
    /// The backend is the authority on SQL validity; an unparseable query
    /// still gets a statement type and read-only flag.
    pub fn analyze_or_fallback(&self, sql: &str) -> QueryAnalysis {
        match self.analyze(sql) {
            Ok(analysis) => analysis,
            Err(e) => {
                debug!(error = %e, "Falling back to keyword analysis");
                QueryAnalysis::of(keyword_statement_type(sql))
            }
        }
    }

    fn analyze_statement(&self, stmt: &Statement) -> QueryAnalysis {
        match stmt {
            Statement::Query(query) => self.analyze_query(query),
            Statement::Insert {
                table_name,
                columns,
                source,
                ..
            } => {
                let mut analysis = QueryAnalysis::of(StatementType::Insert);
                analysis.tables.push(table_name.to_string());

                // Shard keys come from the first VALUES row
                if let Some(src) = source {
                    if let SetExpr::Values(values) = src.body.as_ref() {
                        if let Some(first_row) = values.rows.first() {
                            for (col, expr) in columns.iter().zip(first_row) {
                                if let Some(val) = self.extract_key_value(expr) {
                                    analysis.shard_keys.push((col.value.clone(), val));
                                }
                            }
                        }
                    }
                }
                analysis
            }
            Statement::Update {
                table, selection, ..
            } => {
                let mut analysis = QueryAnalysis::of(StatementType::Update);
                analysis.tables = self.table_names(table);
                if let Some(expr) = selection {
                    self.extract_shard_keys(expr, &mut analysis.shard_keys);
                }
                analysis
            }
            Statement::Delete {
                from, selection, ..
            } => {
                let mut analysis = QueryAnalysis::of(StatementType::Delete);
                analysis.tables = from.iter().flat_map(|t| self.table_names(t)).collect();
                if let Some(expr) = selection {
                    self.extract_shard_keys(expr, &mut analysis.shard_keys);
                }
                analysis
            }
            Statement::SetVariable { .. } => QueryAnalysis::of(StatementType::Set),
            Statement::ShowTables { .. }
            | Statement::ShowColumns { .. }
            | Statement::ShowVariable { .. }
            | Statement::ShowVariables { .. }
            | Statement::ShowCreate { .. }
            | Statement::ShowCollation { .. }
            | Statement::ShowFunctions { .. }
            | Statement::ExplainTable { .. }
            | Statement::Explain { .. } => QueryAnalysis::of(StatementType::Show),
            Statement::Call(_) => QueryAnalysis::of(StatementType::Call),
            Statement::Use { db_name } => {
                let mut analysis = QueryAnalysis::of(StatementType::Use);
                analysis.tables.push(db_name.to_string());
                analysis
            }
            _ => QueryAnalysis::of(StatementType::Other),
        }
    }

    fn analyze_query(&self, query: &Query) -> QueryAnalysis {
        let mut analysis = QueryAnalysis::of(StatementType::Select);

        if let SetExpr::Select(select) = query.body.as_ref() {
            for table_with_joins in &select.from {
                analysis.tables.extend(self.table_names(table_with_joins));
            }
            if let Some(selection) = &select.selection {
                self.extract_shard_keys(selection, &mut analysis.shard_keys);
            }
        }
        analysis
    }

    fn table_names(&self, table_with_joins: &TableWithJoins) -> Vec<String> {
        std::iter::once(&table_with_joins.relation)
            .chain(table_with_joins.joins.iter().map(|j| &j.relation))
            .filter_map(|factor| match factor {
                TableFactor::Table { name, .. } => Some(name.to_string()),
                _ => None,
            })
            .collect()
    }

    fn extract_shard_keys(&self, expr: &Expr, result: &mut Vec<(String, ShardKeyValue)>) {
        match expr {
            Expr::BinaryOp { left, op, right } => match op {
                BinaryOperator::Eq => {
                    if let Some(pair) = self.column_value_pair(left, right) {
                        result.push(pair);
                    }
                }
                BinaryOperator::And => {
                    self.extract_shard_keys(left, result);
                    self.extract_shard_keys(right, result);
                }
                _ => {}
            },
            Expr::InList {
                expr,
                list,
                negated: false,
            } => {
                if let Some(col) = column_name(expr) {
                    let values: Vec<i64> = list.iter().filter_map(literal_int).collect();
                    if !values.is_empty() {
                        result.push((col, ShardKeyValue::Multiple(values)));
                    } else if list.iter().any(is_marker) {
                        result.push((col, ShardKeyValue::Parameter));
                    }
                }
            }
            Expr::Between {
                expr,
                low,
                high,
                negated: false,
            } => {
                if let (Some(col), Some(start), Some(end)) =
                    (column_name(expr), literal_int(low), literal_int(high))
                {
                    result.push((col, ShardKeyValue::Range { start, end }));
                }
            }
            Expr::Nested(inner) => self.extract_shard_keys(inner, result),
            _ => {}
        }
    }

    fn column_value_pair(&self, left: &Expr, right: &Expr) -> Option<(String, ShardKeyValue)> {
        if let Some(col) = column_name(left) {
            if let Some(val) = self.extract_key_value(right) {
                return Some((col, val));
            }
        }
        if let Some(col) = column_name(right) {
            if let Some(val) = self.extract_key_value(left) {
                return Some((col, val));
            }
        }
        None
    }

    fn extract_key_value(&self, expr: &Expr) -> Option<ShardKeyValue> {
        if is_marker(expr) {
            return Some(ShardKeyValue::Parameter);
        }
        literal_int(expr).map(ShardKeyValue::Single)
    }
}

impl Default for SqlAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.clone()),
        _ => None,
    }
}

fn is_marker(expr: &Expr) -> bool {
    match expr {
        Expr::Value(Value::SingleQuotedString(s)) => s == "?",
        Expr::Value(Value::Placeholder(_)) => true,
        _ => false,
    }
}

fn literal_int(expr: &Expr) -> Option<i64> {
    match expr {
        Expr::Value(Value::Number(n, _)) => n.parse().ok(),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match expr.as_ref() {
            Expr::Value(Value::Number(n, _)) => n.parse::<i64>().ok().map(|v| -v),
            _ => None,
        },
        _ => None,
    }
}

/// Statement type from the leading keyword alone
fn keyword_statement_type(sql: &str) -> StatementType {
    let upper = sql.trim_start().to_uppercase();
    let first = upper.split(|c: char| !c.is_ascii_alphabetic()).next().unwrap_or("");
    match first {
        "SELECT" | "WITH" => StatementType::Select,
        "SHOW" | "DESC" | "DESCRIBE" | "EXPLAIN" => StatementType::Show,
        "INSERT" | "REPLACE" => StatementType::Insert,
        "UPDATE" => StatementType::Update,
        "DELETE" => StatementType::Delete,
        "SET" => StatementType::Set,
        "USE" => StatementType::Use,
        "CALL" => StatementType::Call,
        _ => StatementType::Other,
    }
}

/// Analyzer errors
#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("Failed to parse SQL: {0}")]
    ParseError(String),

    #[error("Empty statement")]
    EmptyStatement,
}
