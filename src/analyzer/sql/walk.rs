//! Collects table references and predicate columns from a parsed statement.

use std::sync::LazyLock;

use regex::Regex;
use sqlparser::ast::{
    BinaryOperator, Expr, FromTable, JoinConstraint, JoinOperator, ObjectName, ObjectNamePart,
    ObjectType, Query, Select, SetExpr, Statement, TableFactor, TableObject, TableWithJoins,
};

use super::{
    ActionStatement, ColumnRef, ParsedStatement, Predicate, StatementKind, TableRef, split_name,
    unquote,
};

static ALTER_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^ALTER\s+TABLE\s+(\S+)\s+(.*)$").expect("valid regex"));

static ADD_INDEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^ADD\s+(?:INDEX|KEY)\b[^(]*\((.*)\)").expect("valid regex")
});

static DROP_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^DROP\s+(?:INDEX|KEY)\s+(\S+)\s*$").expect("valid regex"));

#[derive(Default)]
struct Walker {
    tables: Vec<TableRef>,
    columns: Vec<ColumnRef>,
}

pub(super) fn statement(statement: &Statement) -> ParsedStatement {
    let mut walker = Walker::default();
    let kind = walker.statement(statement);
    ParsedStatement {
        kind,
        tables: walker.tables,
        columns: walker.columns,
    }
}

pub(super) fn action(statement: &Statement) -> ActionStatement {
    match statement {
        Statement::Query(query) => {
            let mut walker = Walker::default();
            walker.query(query);
            ActionStatement::Select {
                tables: walker.tables,
            }
        }
        Statement::CreateIndex(create) => {
            let columns: Option<Vec<String>> = create
                .columns
                .iter()
                .map(|c| match &c.column.expr {
                    Expr::Identifier(ident) => Some(ident.value.clone()),
                    _ => None,
                })
                .collect();
            match columns {
                Some(columns) if !columns.is_empty() => ActionStatement::CreateIndex {
                    table: table_ref(&create.table_name, None),
                    columns,
                },
                _ => ActionStatement::Other,
            }
        }
        Statement::Drop {
            object_type: ObjectType::Index,
            names,
            table,
            ..
        } if names.len() == 1 => ActionStatement::DropIndex {
            table: table.as_ref().map(|name| table_ref(name, None)),
            index: object_parts(&names[0]).pop().unwrap_or_default(),
        },
        Statement::AlterTable { operations, .. } if operations.len() == 1 => {
            alter_table(&statement.to_string())
        }
        _ => ActionStatement::Other,
    }
}

/// Reads the canonical rendering of a single-operation `ALTER TABLE`.
fn alter_table(rendered: &str) -> ActionStatement {
    let Some(caps) = ALTER_TABLE.captures(rendered) else {
        return ActionStatement::Other;
    };
    let (schema, name) = split_name(&caps[1]);
    let table = TableRef {
        schema,
        table: name,
        alias: None,
    };
    let operation = caps[2].trim();
    if let Some(add) = ADD_INDEX.captures(operation) {
        let columns: Vec<String> = add[1]
            .split(',')
            .map(|part| unquote(part.split('(').next().unwrap_or_default().trim()))
            .filter(|c| !c.is_empty())
            .collect();
        if columns.is_empty() {
            return ActionStatement::Other;
        }
        return ActionStatement::CreateIndex { table, columns };
    }
    if let Some(drop) = DROP_INDEX.captures(operation) {
        return ActionStatement::DropIndex {
            table: Some(table),
            index: unquote(&drop[1]),
        };
    }
    ActionStatement::Other
}

fn object_parts(name: &ObjectName) -> Vec<String> {
    name.0
        .iter()
        .filter_map(ObjectNamePart::as_ident)
        .map(|ident| ident.value.clone())
        .collect()
}

fn table_ref(name: &ObjectName, alias: Option<String>) -> TableRef {
    let mut parts = object_parts(name);
    let table = parts.pop().unwrap_or_default();
    TableRef {
        schema: parts.pop(),
        table,
        alias,
    }
}

fn join_constraint(operator: &JoinOperator) -> Option<&JoinConstraint> {
    match operator {
        JoinOperator::Join(constraint)
        | JoinOperator::Inner(constraint)
        | JoinOperator::Left(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::Right(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint)
        | JoinOperator::CrossJoin(constraint) => Some(constraint),
        _ => None,
    }
}

impl Walker {
    fn statement(&mut self, statement: &Statement) -> StatementKind {
        match statement {
            Statement::Query(query) => {
                self.query(query);
                StatementKind::Select
            }
            Statement::Insert(insert) => {
                if let TableObject::TableName(name) = &insert.table {
                    self.tables.push(table_ref(name, None));
                }
                for column in &insert.columns {
                    self.columns.push(ColumnRef {
                        qualifier: None,
                        column: column.value.clone(),
                        predicate: Predicate::Other,
                    });
                }
                if let Some(source) = &insert.source {
                    self.query(source);
                }
                if insert.replace_into {
                    StatementKind::Replace
                } else {
                    StatementKind::Insert
                }
            }
            Statement::Update {
                table, selection, ..
            } => {
                self.table_with_joins(table);
                if let Some(expr) = selection {
                    self.predicate(expr);
                }
                StatementKind::Update
            }
            Statement::Delete(delete) => {
                let (FromTable::WithFromKeyword(from) | FromTable::WithoutKeyword(from)) =
                    &delete.from;
                for table in from {
                    self.table_with_joins(table);
                }
                if let Some(expr) = &delete.selection {
                    self.predicate(expr);
                }
                StatementKind::Delete
            }
            _ => StatementKind::Other,
        }
    }

    fn query(&mut self, query: &Query) {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.query(&cte.query);
            }
        }
        self.set_expr(&query.body);
    }

    fn set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => self.select(select),
            SetExpr::Query(query) => self.query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.set_expr(left);
                self.set_expr(right);
            }
            _ => {}
        }
    }

    fn select(&mut self, select: &Select) {
        for from in &select.from {
            self.table_with_joins(from);
        }
        if let Some(expr) = &select.selection {
            self.predicate(expr);
        }
        if let Some(expr) = &select.having {
            self.predicate(expr);
        }
    }

    fn table_with_joins(&mut self, from: &TableWithJoins) {
        self.table_factor(&from.relation);
        for join in &from.joins {
            let joined = self.table_factor(&join.relation);
            match join_constraint(&join.join_operator) {
                Some(JoinConstraint::On(expr)) => self.predicate(expr),
                Some(JoinConstraint::Using(names)) => {
                    for name in names {
                        self.columns.push(ColumnRef {
                            qualifier: joined.clone(),
                            column: unquote(&name.to_string()),
                            predicate: Predicate::Equality,
                        });
                    }
                }
                _ => {}
            }
        }
    }

    /// Returns the qualifier of a plain table, if the factor is one.
    fn table_factor(&mut self, factor: &TableFactor) -> Option<String> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let table = table_ref(name, alias.as_ref().map(|a| a.name.value.clone()));
                let qualifier = table.qualifier().to_string();
                self.tables.push(table);
                Some(qualifier)
            }
            TableFactor::Derived { subquery, .. } => {
                self.query(subquery);
                None
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                self.table_with_joins(table_with_joins);
                None
            }
            _ => None,
        }
    }

    fn predicate(&mut self, expr: &Expr) {
        match expr {
            Expr::BinaryOp { left, op, right } => match op {
                BinaryOperator::And | BinaryOperator::Or | BinaryOperator::Xor => {
                    self.predicate(left);
                    self.predicate(right);
                }
                op => {
                    let predicate = match op {
                        BinaryOperator::Eq | BinaryOperator::Spaceship => Predicate::Equality,
                        BinaryOperator::Lt
                        | BinaryOperator::LtEq
                        | BinaryOperator::Gt
                        | BinaryOperator::GtEq => Predicate::Range,
                        _ => Predicate::Other,
                    };
                    self.operand(left, predicate);
                    self.operand(right, predicate);
                }
            },
            Expr::Nested(inner) => self.predicate(inner),
            Expr::UnaryOp { expr, .. } => self.predicate(expr),
            Expr::Between {
                expr, low, high, ..
            } => {
                self.operand(expr, Predicate::Range);
                self.nested_queries(low);
                self.nested_queries(high);
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let predicate = if *negated {
                    Predicate::Other
                } else {
                    Predicate::Equality
                };
                self.operand(expr, predicate);
                for item in list {
                    self.nested_queries(item);
                }
            }
            Expr::InSubquery { expr, subquery, .. } => {
                self.operand(expr, Predicate::Equality);
                self.query(subquery);
            }
            Expr::Exists { subquery, .. } | Expr::Subquery(subquery) => self.query(subquery),
            Expr::IsNull(expr) => self.operand(expr, Predicate::Equality),
            Expr::IsNotNull(expr) => self.operand(expr, Predicate::Range),
            Expr::Like { expr, .. } | Expr::RLike { expr, .. } => {
                self.operand(expr, Predicate::Range)
            }
            _ => {}
        }
    }

    /// Records a bare column operand. Columns wrapped in functions or
    /// arithmetic cannot use an index and are skipped.
    fn operand(&mut self, expr: &Expr, predicate: Predicate) {
        match expr {
            Expr::Identifier(ident) => self.columns.push(ColumnRef {
                qualifier: None,
                column: ident.value.clone(),
                predicate,
            }),
            Expr::CompoundIdentifier(idents) if idents.len() >= 2 => {
                self.columns.push(ColumnRef {
                    qualifier: Some(idents[idents.len() - 2].value.clone()),
                    column: idents[idents.len() - 1].value.clone(),
                    predicate,
                })
            }
            Expr::Nested(inner) => self.operand(inner, predicate),
            Expr::Subquery(query) => self.query(query),
            _ => {}
        }
    }

    fn nested_queries(&mut self, expr: &Expr) {
        if let Expr::Subquery(query) = expr {
            self.query(query);
        }
    }
}
