//! SQL parser
//!
//! Recursive descent over the token stream, producing the AST.

use super::ast::*;
use super::lexer::Lexer;
use super::token::Token;
use crate::catalog::DataType;
use crate::error::{Error, Result};

/// SQL parser
pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    /// Create a parser from a SQL string.
    pub fn new(sql: &str) -> Result<Self> {
        let mut lexer = Lexer::new(sql);
        let tokens = lexer.tokenize()?;
        Ok(Self {
            tokens,
            position: 0,
        })
    }

    /// Parse a single SQL statement, consuming an optional trailing
    /// semicolon. Trailing tokens are a syntax error.
    pub fn parse(&mut self) -> Result<Statement> {
        let stmt = self.parse_statement()?;
        if self.check(&Token::Semicolon) {
            self.advance();
        }
        if !self.is_at_end() {
            return Err(Error::UnexpectedToken {
                expected: "end of statement".to_string(),
                found: format!("{}", self.current()),
            });
        }
        Ok(stmt)
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        match self.current() {
            Token::Select | Token::With => self.parse_select().map(Statement::Select),
            Token::Insert => self.parse_insert().map(Statement::Insert),
            Token::Update => self.parse_update().map(Statement::Update),
            Token::Delete => self.parse_delete().map(Statement::Delete),
            Token::Create => self.parse_create(),
            Token::Begin => self.parse_begin(),
            Token::Commit => self.parse_tx_end(Token::Commit, Statement::Commit),
            Token::Rollback => self.parse_tx_end(Token::Rollback, Statement::Rollback),
            _ => Err(Error::UnexpectedToken {
                expected: "SELECT, INSERT, UPDATE, DELETE, CREATE, BEGIN, COMMIT, or ROLLBACK"
                    .to_string(),
                found: format!("{}", self.current()),
            }),
        }
    }

    // ========== SELECT ==========

    fn parse_select(&mut self) -> Result<SelectStatement> {
        let ctes = if self.check(&Token::With) {
            self.parse_with_clause()?
        } else {
            Vec::new()
        };

        self.expect(&Token::Select)?;

        let mut stmt = SelectStatement {
            ctes,
            ..SelectStatement::default()
        };

        stmt.projection = self.parse_select_list()?;

        self.expect(&Token::From)?;
        stmt.from = self.parse_table_ref()?;

        while self.is_join_start() {
            stmt.joins.push(self.parse_join()?);
        }

        if self.check(&Token::Where) {
            self.advance();
            stmt.where_clause = Some(self.parse_expr()?);
        }

        if self.check(&Token::Group) {
            self.advance();
            self.expect(&Token::By)?;
            loop {
                stmt.group_by.push(self.parse_column_ref()?);
                if !self.check(&Token::Comma) {
                    break;
                }
                self.advance();
            }
        }

        if self.check(&Token::Order) {
            self.advance();
            self.expect(&Token::By)?;
            loop {
                let expr = self.parse_expr()?;
                let ascending = if self.check(&Token::Desc) {
                    self.advance();
                    false
                } else {
                    if self.check(&Token::Asc) {
                        self.advance();
                    }
                    true
                };
                stmt.order_by.push(OrderByItem { expr, ascending });
                if !self.check(&Token::Comma) {
                    break;
                }
                self.advance();
            }
        }

        Ok(stmt)
    }

    fn parse_with_clause(&mut self) -> Result<Vec<Cte>> {
        self.expect(&Token::With)?;
        let mut ctes = Vec::new();
        loop {
            let name = self.expect_identifier()?;
            self.expect(&Token::As)?;
            self.expect(&Token::LParen)?;
            let query = self.parse_select()?;
            self.expect(&Token::RParen)?;
            ctes.push(Cte { name, query });
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }
        Ok(ctes)
    }

    fn parse_select_list(&mut self) -> Result<Vec<SelectItem>> {
        let mut items = Vec::new();
        loop {
            items.push(self.parse_select_item()?);
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }
        Ok(items)
    }

    fn parse_select_item(&mut self) -> Result<SelectItem> {
        if self.check(&Token::Asterisk) {
            self.advance();
            return Ok(SelectItem::Wildcard);
        }

        if self.current().is_aggregate() {
            return self.parse_aggregate();
        }

        let expr = self.parse_expr()?;
        let alias = self.parse_alias()?;
        Ok(SelectItem::Expr { expr, alias })
    }

    fn parse_aggregate(&mut self) -> Result<SelectItem> {
        let func = match self.current() {
            Token::Count => AggFunc::Count,
            Token::Sum => AggFunc::Sum,
            Token::Avg => AggFunc::Avg,
            Token::Min => AggFunc::Min,
            Token::Max => AggFunc::Max,
            other => {
                return Err(Error::UnexpectedToken {
                    expected: "aggregate function".to_string(),
                    found: format!("{}", other),
                })
            }
        };
        self.advance();
        self.expect(&Token::LParen)?;

        let (arg, arg_text) = if self.check(&Token::Asterisk) {
            self.advance();
            (AggArg::Star, "*".to_string())
        } else {
            let expr = self.parse_expr()?;
            let text = expr.display_name();
            (AggArg::Expr(expr), text)
        };
        self.expect(&Token::RParen)?;

        let label = format!("{}({})", func, arg_text);
        let alias = self.parse_alias()?;
        Ok(SelectItem::Aggregate {
            func,
            arg,
            alias,
            label,
        })
    }

    fn parse_alias(&mut self) -> Result<Option<String>> {
        if self.check(&Token::As) {
            self.advance();
            return Ok(Some(self.expect_identifier()?));
        }
        Ok(None)
    }

    fn parse_table_ref(&mut self) -> Result<TableRef> {
        let name = self.expect_identifier()?;
        // Alias, with or without AS.
        let alias = if self.check(&Token::As) {
            self.advance();
            Some(self.expect_identifier()?)
        } else if let Token::Identifier(_) = self.current() {
            Some(self.expect_identifier()?)
        } else {
            None
        };
        Ok(TableRef { name, alias })
    }

    fn is_join_start(&self) -> bool {
        matches!(
            self.current(),
            Token::Join | Token::Inner | Token::Left
        )
    }

    fn parse_join(&mut self) -> Result<Join> {
        let kind = if self.check(&Token::Inner) {
            self.advance();
            JoinKind::Inner
        } else if self.check(&Token::Left) {
            self.advance();
            JoinKind::Left
        } else {
            JoinKind::Inner // bare JOIN
        };
        self.expect(&Token::Join)?;
        let table = self.parse_table_ref()?;
        self.expect(&Token::On)?;
        let condition = self.parse_expr()?;
        Ok(Join {
            kind,
            table,
            condition,
        })
    }

    // ========== INSERT ==========

    fn parse_insert(&mut self) -> Result<InsertStatement> {
        self.expect(&Token::Insert)?;
        self.expect(&Token::Into)?;
        let table_name = self.expect_identifier()?;

        let columns = if self.check(&Token::LParen) {
            self.advance();
            let cols = self.parse_identifier_list()?;
            self.expect(&Token::RParen)?;
            Some(cols)
        } else {
            None
        };

        self.expect(&Token::Values)?;

        let mut values = Vec::new();
        loop {
            self.expect(&Token::LParen)?;
            let mut row = Vec::new();
            loop {
                row.push(self.parse_expr()?);
                if !self.check(&Token::Comma) {
                    break;
                }
                self.advance();
            }
            self.expect(&Token::RParen)?;
            values.push(row);
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }

        Ok(InsertStatement {
            table_name,
            columns,
            values,
        })
    }

    // ========== UPDATE ==========

    fn parse_update(&mut self) -> Result<UpdateStatement> {
        self.expect(&Token::Update)?;
        let table_name = self.expect_identifier()?;
        self.expect(&Token::Set)?;

        let mut assignments = Vec::new();
        loop {
            let column = self.expect_identifier()?;
            self.expect(&Token::Eq)?;
            let value = self.parse_expr()?;
            assignments.push(Assignment { column, value });
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }

        let where_clause = if self.check(&Token::Where) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };

        Ok(UpdateStatement {
            table_name,
            assignments,
            where_clause,
        })
    }

    // ========== DELETE ==========

    fn parse_delete(&mut self) -> Result<DeleteStatement> {
        self.expect(&Token::Delete)?;
        self.expect(&Token::From)?;
        let table_name = self.expect_identifier()?;

        let where_clause = if self.check(&Token::Where) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };

        Ok(DeleteStatement {
            table_name,
            where_clause,
        })
    }

    // ========== CREATE ==========

    fn parse_create(&mut self) -> Result<Statement> {
        self.expect(&Token::Create)?;
        match self.current() {
            Token::Table => self.parse_create_table().map(Statement::CreateTable),
            Token::Index => self.parse_create_index().map(Statement::CreateIndex),
            _ => Err(Error::UnexpectedToken {
                expected: "TABLE or INDEX".to_string(),
                found: format!("{}", self.current()),
            }),
        }
    }

    fn parse_create_table(&mut self) -> Result<CreateTableStatement> {
        self.expect(&Token::Table)?;
        let table_name = self.expect_identifier()?;
        self.expect(&Token::LParen)?;

        let mut columns = Vec::new();
        loop {
            columns.push(self.parse_column_def()?);
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }
        self.expect(&Token::RParen)?;

        Ok(CreateTableStatement {
            table_name,
            columns,
        })
    }

    fn parse_column_def(&mut self) -> Result<ColumnDef> {
        let name = self.expect_identifier()?;
        let data_type = match self.current() {
            Token::Int => {
                self.advance();
                DataType::Int
            }
            Token::Str => {
                self.advance();
                DataType::Str
            }
            other => {
                return Err(Error::UnexpectedToken {
                    expected: "INT or STR".to_string(),
                    found: format!("{}", other),
                })
            }
        };

        let mut not_null = false;
        let mut primary_key = false;
        loop {
            if self.check(&Token::Primary) {
                self.advance();
                self.expect(&Token::Key)?;
                primary_key = true;
                not_null = true;
            } else if self.check(&Token::Not) {
                self.advance();
                self.expect(&Token::Null)?;
                not_null = true;
            } else {
                break;
            }
        }

        Ok(ColumnDef {
            name,
            data_type,
            not_null,
            primary_key,
        })
    }

    fn parse_create_index(&mut self) -> Result<CreateIndexStatement> {
        self.expect(&Token::Index)?;
        let index_name = self.expect_identifier()?;
        self.expect(&Token::On)?;
        let table_name = self.expect_identifier()?;
        self.expect(&Token::LParen)?;
        let column = self.expect_identifier()?;
        self.expect(&Token::RParen)?;
        Ok(CreateIndexStatement {
            index_name,
            table_name,
            column,
        })
    }

    // ========== Transactions ==========

    fn parse_begin(&mut self) -> Result<Statement> {
        self.expect(&Token::Begin)?;
        if self.check(&Token::Transaction) {
            self.advance();
        }
        Ok(Statement::Begin)
    }

    fn parse_tx_end(&mut self, token: Token, stmt: Statement) -> Result<Statement> {
        self.expect(&token)?;
        if self.check(&Token::Transaction) {
            self.advance();
        }
        Ok(stmt)
    }

    // ========== Expressions ==========

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or_expr()
    }

    fn parse_or_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_and_expr()?;
        while self.check(&Token::Or) {
            self.advance();
            let right = self.parse_and_expr()?;
            left = Expr::BinaryOp {
                left: Box::new(left),
                op: BinaryOperator::Or,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_not_expr()?;
        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_not_expr()?;
            left = Expr::BinaryOp {
                left: Box::new(left),
                op: BinaryOperator::And,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not_expr(&mut self) -> Result<Expr> {
        if self.check(&Token::Not) {
            self.advance();
            let expr = self.parse_not_expr()?;
            return Ok(Expr::Not(Box::new(expr)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_primary()?;
        let op = match self.current() {
            Token::Eq => Some(BinaryOperator::Eq),
            Token::Neq => Some(BinaryOperator::Neq),
            Token::Lt => Some(BinaryOperator::Lt),
            Token::Gt => Some(BinaryOperator::Gt),
            Token::Lte => Some(BinaryOperator::Lte),
            Token::Gte => Some(BinaryOperator::Gte),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_primary()?;
            return Ok(Expr::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            });
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.current().clone() {
            Token::IntegerLiteral(n) => {
                self.advance();
                Ok(Expr::Literal(Literal::Integer(n)))
            }
            Token::StringLiteral(s) => {
                self.advance();
                Ok(Expr::Literal(Literal::String(s)))
            }
            Token::Null => {
                self.advance();
                Ok(Expr::Literal(Literal::Null))
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Token::Identifier(_) => Ok(Expr::Column(self.parse_column_ref()?)),
            other => Err(Error::UnexpectedToken {
                expected: "expression".to_string(),
                found: format!("{}", other),
            }),
        }
    }

    fn parse_column_ref(&mut self) -> Result<ColumnRef> {
        let first = self.expect_identifier()?;
        if self.check(&Token::Dot) {
            self.advance();
            let column = self.expect_identifier()?;
            Ok(ColumnRef {
                table: Some(first),
                column,
            })
        } else {
            Ok(ColumnRef {
                table: None,
                column: first,
            })
        }
    }

    // ========== Helpers ==========

    fn current(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }

    fn is_at_end(&self) -> bool {
        matches!(self.current(), Token::Eof)
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.current()) == std::mem::discriminant(token)
    }

    fn expect(&mut self, token: &Token) -> Result<()> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(Error::UnexpectedToken {
                expected: format!("{}", token),
                found: format!("{}", self.current()),
            })
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        match self.current().clone() {
            Token::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(Error::UnexpectedToken {
                expected: "identifier".to_string(),
                found: format!("{}", other),
            }),
        }
    }

    fn parse_identifier_list(&mut self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        loop {
            names.push(self.expect_identifier()?);
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }
        Ok(names)
    }
}
