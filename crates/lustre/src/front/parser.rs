//! Recursive-descent parser producing the syntax tree.
//!
//! The parser is tolerant: on an unexpected token it raises a diagnostic and
//! synchronizes at the next statement boundary so one mistake doesn't bury
//! the rest of the file. The analyzer performs all name/type resolution; the
//! parser only shapes nodes.

use crate::{
    diagnostics::{CompilationErrors, DiagnosticCode},
    front::{
        ast::{AttributeNode, BinaryToken, NodeKind, SyntaxTree, TypeName, TypeNameArg},
        lexer::{StringSegment, Token, TokenKind, tokenize},
    },
    ids::NodeId,
    location::{CodeEntry, CodeLocation},
    opcode::{BinaryOp, UnaryOp},
    value::Constant,
};

/// Parses an ordered set of code entries into one syntax tree with a shared
/// root. Parent links are fixed up before returning.
pub fn parse_entries(entries: &[CodeEntry], errors: &mut CompilationErrors) -> SyntaxTree {
    let mut tree = SyntaxTree::new();
    let mut items = Vec::new();
    for entry in entries {
        let tokens = tokenize(&entry.origin, &entry.code, errors);
        let mut parser = Parser {
            tokens,
            position: 0,
            tree: &mut tree,
            errors,
        };
        parser.parse_items(&mut items);
    }
    let root_location = entries
        .first()
        .map_or_else(CodeLocation::default, |e| CodeLocation::point(&e.origin, 1, 1));
    tree.root = tree.add(NodeKind::Root { items }, root_location);
    tree.fixup_parents(tree.root);
    tree
}

struct Parser<'a> {
    tokens: Vec<Token>,
    position: usize,
    tree: &'a mut SyntaxTree,
    errors: &'a mut CompilationErrors,
}

impl Parser<'_> {
    fn peek(&self) -> &TokenKind {
        &self.tokens[self.position.min(self.tokens.len() - 1)].kind
    }

    fn peek_ahead(&self, offset: usize) -> &TokenKind {
        &self.tokens[(self.position + offset).min(self.tokens.len() - 1)].kind
    }

    fn here(&self) -> CodeLocation {
        self.tokens[self.position.min(self.tokens.len() - 1)].location.clone()
    }

    fn bump(&mut self) -> Token {
        let token = self.tokens[self.position.min(self.tokens.len() - 1)].clone();
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
        token
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> bool {
        if self.eat(kind) {
            true
        } else {
            let found: &'static str = self.peek().into();
            self.errors.raise(
                self.here(),
                DiagnosticCode::UnexpectedToken,
                format!("expected {what}, found {found}"),
            );
            false
        }
    }

    fn expect_identifier(&mut self, what: &str) -> Option<String> {
        if let TokenKind::Identifier(name) = self.peek() {
            let name = name.clone();
            self.bump();
            Some(name)
        } else {
            self.errors.raise(
                self.here(),
                DiagnosticCode::ExpectedIdentifier,
                format!("expected {what}"),
            );
            None
        }
    }

    /// Skips forward to a likely statement boundary after an error.
    fn synchronize(&mut self) {
        loop {
            match self.peek() {
                TokenKind::Semicolon => {
                    self.bump();
                    return;
                }
                TokenKind::RightBrace | TokenKind::EndOfFile => return,
                _ => {
                    self.bump();
                }
            }
        }
    }

    // --- items ---

    fn parse_items(&mut self, items: &mut Vec<NodeId>) {
        while !self.at(&TokenKind::EndOfFile) {
            let attributes = self.parse_attributes();
            let item = match self.peek() {
                TokenKind::Class | TokenKind::Struct => self.parse_class(attributes),
                TokenKind::Enum => self.parse_enum(attributes),
                TokenKind::Function | TokenKind::Static | TokenKind::Virtual | TokenKind::Override => {
                    self.parse_free_function(attributes)
                }
                _ => {
                    if !attributes.is_empty() {
                        self.errors.raise(
                            self.here(),
                            DiagnosticCode::UnexpectedToken,
                            "attributes must precede a declaration",
                        );
                    }
                    self.parse_statement()
                }
            };
            match item {
                Some(id) => items.push(id),
                None => self.synchronize(),
            }
        }
    }

    fn parse_attributes(&mut self) -> Vec<AttributeNode> {
        let mut attributes = Vec::new();
        while self.at(&TokenKind::LeftBracket) && matches!(self.peek_ahead(1), TokenKind::Identifier(_)) {
            let location = self.here();
            self.bump(); // [
            let Some(name) = self.expect_identifier("attribute name") else {
                self.synchronize();
                return attributes;
            };
            let mut parameters = Vec::new();
            if self.eat(&TokenKind::LeftParen) {
                while !self.at(&TokenKind::RightParen) {
                    if let Some(constant) = self.parse_constant_literal() {
                        parameters.push(constant);
                    } else {
                        break;
                    }
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RightParen, "')' after attribute parameters");
            }
            self.expect(&TokenKind::RightBracket, "']' after attribute");
            attributes.push(AttributeNode {
                name,
                parameters,
                location,
            });
        }
        attributes
    }

    fn parse_constant_literal(&mut self) -> Option<Constant> {
        let negative = self.eat(&TokenKind::Minus);
        let constant = match self.peek().clone() {
            TokenKind::IntegerLiteral(v) => Constant::Integer(if negative { -v } else { v }),
            TokenKind::RealLiteral(v) => Constant::Real(if negative { -v } else { v }),
            TokenKind::StringLiteral(segments) => {
                let mut text = String::new();
                for segment in &segments {
                    match segment {
                        StringSegment::Text(t) => text.push_str(t),
                        StringSegment::Splice { .. } => {
                            self.errors.raise(
                                self.here(),
                                DiagnosticCode::UnexpectedToken,
                                "attribute parameters must be literal constants",
                            );
                        }
                    }
                }
                Constant::Str(text)
            }
            TokenKind::True => Constant::Boolean(true),
            TokenKind::False => Constant::Boolean(false),
            TokenKind::Null => Constant::Null,
            _ => {
                self.errors.raise(
                    self.here(),
                    DiagnosticCode::UnexpectedToken,
                    "expected a literal constant",
                );
                return None;
            }
        };
        self.bump();
        Some(constant)
    }

    fn parse_type_name(&mut self) -> Option<TypeName> {
        let location = self.here();
        let name = self.expect_identifier("a type name")?;
        let mut template_args = Vec::new();
        if self.at(&TokenKind::LeftBracket) {
            self.bump();
            loop {
                // Array lengths and similar constant arguments sit alongside
                // type arguments.
                if let TokenKind::IntegerLiteral(value) = *self.peek() {
                    self.bump();
                    template_args.push(TypeNameArg::Integer(value));
                } else {
                    template_args.push(TypeNameArg::Type(self.parse_type_name()?));
                }
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RightBracket, "']' after template arguments");
        }
        Some(TypeName {
            name,
            template_args,
            location,
        })
    }

    // --- declarations ---

    fn parse_class(&mut self, attributes: Vec<AttributeNode>) -> Option<NodeId> {
        let location = self.here();
        let is_struct = self.at(&TokenKind::Struct);
        self.bump(); // class | struct
        let name = self.expect_identifier("a class name")?;

        let mut template_params = Vec::new();
        if self.eat(&TokenKind::LeftBracket) {
            loop {
                template_params.push(self.expect_identifier("a template parameter")?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RightBracket, "']' after template parameters");
        }

        let parent = if self.eat(&TokenKind::Colon) {
            self.parse_type_name()
        } else {
            None
        };

        self.expect(&TokenKind::LeftBrace, "'{' to open the class body");
        let mut members = Vec::new();
        while !self.at(&TokenKind::RightBrace) && !self.at(&TokenKind::EndOfFile) {
            match self.parse_member() {
                Some(member) => members.push(member),
                None => self.synchronize(),
            }
        }
        self.expect(&TokenKind::RightBrace, "'}' to close the class body");

        Some(self.tree.add(
            NodeKind::Class {
                name,
                is_struct,
                template_params,
                parent,
                attributes,
                members,
                resolved_type: None,
            },
            location,
        ))
    }

    fn parse_enum(&mut self, attributes: Vec<AttributeNode>) -> Option<NodeId> {
        let location = self.here();
        self.bump(); // enum
        let name = self.expect_identifier("an enum name")?;
        self.expect(&TokenKind::LeftBrace, "'{' to open the enum body");
        let mut values = Vec::new();
        while !self.at(&TokenKind::RightBrace) && !self.at(&TokenKind::EndOfFile) {
            let value_name = self.expect_identifier("an enum value name")?;
            let explicit = if self.eat(&TokenKind::Assign) {
                match self.peek().clone() {
                    TokenKind::IntegerLiteral(v) => {
                        self.bump();
                        Some(v)
                    }
                    _ => {
                        self.errors.raise(
                            self.here(),
                            DiagnosticCode::UnexpectedToken,
                            "enum values must be integer literals",
                        );
                        None
                    }
                }
            } else {
                None
            };
            values.push((value_name, explicit));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RightBrace, "'}' to close the enum body");
        Some(self.tree.add(
            NodeKind::Enum {
                name,
                values,
                attributes,
                resolved_type: None,
            },
            location,
        ))
    }

    fn parse_member(&mut self) -> Option<NodeId> {
        let attributes = self.parse_attributes();
        let mut is_static = false;
        let mut is_virtual = false;
        let mut is_override = false;
        loop {
            match self.peek() {
                TokenKind::Static => {
                    is_static = true;
                    self.bump();
                }
                TokenKind::Virtual => {
                    is_virtual = true;
                    self.bump();
                }
                TokenKind::Override => {
                    is_override = true;
                    self.bump();
                }
                _ => break,
            }
        }
        match self.peek() {
            TokenKind::Var => self.parse_member_variable(attributes, is_static),
            TokenKind::Property => self.parse_property(attributes, is_static),
            TokenKind::Function => self.parse_function(attributes, is_static, is_virtual, is_override),
            TokenKind::Constructor => self.parse_constructor(attributes),
            TokenKind::Destructor => self.parse_destructor(),
            TokenKind::Sends => self.parse_sends_event(),
            _ => {
                let found: &'static str = self.peek().into();
                self.errors.raise(
                    self.here(),
                    DiagnosticCode::UnexpectedToken,
                    format!("expected a member declaration, found {found}"),
                );
                None
            }
        }
    }

    fn parse_member_variable(&mut self, attributes: Vec<AttributeNode>, is_static: bool) -> Option<NodeId> {
        let location = self.here();
        self.bump(); // var
        let name = self.expect_identifier("a field name")?;
        self.expect(&TokenKind::Colon, "':' before the field type");
        let declared_type = self.parse_type_name()?;
        let initializer = if self.eat(&TokenKind::Assign) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.expect(&TokenKind::Semicolon, "';' after the field");
        Some(self.tree.add(
            NodeKind::MemberVariable {
                name,
                declared_type,
                initializer,
                is_static,
                attributes,
                resolved_field: None,
            },
            location,
        ))
    }

    fn parse_property(&mut self, attributes: Vec<AttributeNode>, is_static: bool) -> Option<NodeId> {
        let location = self.here();
        self.bump(); // property
        let name = self.expect_identifier("a property name")?;
        self.expect(&TokenKind::Colon, "':' before the property type");
        let declared_type = self.parse_type_name()?;
        self.expect(&TokenKind::LeftBrace, "'{' to open the property body");
        let mut get_body = None;
        let mut set_body = None;
        while !self.at(&TokenKind::RightBrace) && !self.at(&TokenKind::EndOfFile) {
            if self.eat(&TokenKind::Get) {
                get_body = self.parse_scope();
            } else if self.eat(&TokenKind::Set) {
                set_body = self.parse_scope();
            } else {
                self.errors.raise(
                    self.here(),
                    DiagnosticCode::UnexpectedToken,
                    "expected 'get' or 'set' in a property body",
                );
                self.synchronize();
            }
        }
        self.expect(&TokenKind::RightBrace, "'}' to close the property body");
        Some(self.tree.add(
            NodeKind::Property {
                name,
                declared_type,
                get_body,
                set_body,
                is_static,
                attributes,
                resolved_property: None,
            },
            location,
        ))
    }

    fn parse_free_function(&mut self, attributes: Vec<AttributeNode>) -> Option<NodeId> {
        let mut is_static = true;
        let mut is_virtual = false;
        let mut is_override = false;
        loop {
            match self.peek() {
                TokenKind::Static => {
                    is_static = true;
                    self.bump();
                }
                TokenKind::Virtual => {
                    is_virtual = true;
                    self.bump();
                }
                TokenKind::Override => {
                    is_override = true;
                    self.bump();
                }
                _ => break,
            }
        }
        self.parse_function(attributes, is_static, is_virtual, is_override)
    }

    fn parse_function(
        &mut self,
        attributes: Vec<AttributeNode>,
        is_static: bool,
        is_virtual: bool,
        is_override: bool,
    ) -> Option<NodeId> {
        let location = self.here();
        self.expect(&TokenKind::Function, "'function'");
        let name = self.expect_identifier("a function name")?;
        let parameters = self.parse_parameter_list()?;
        let return_type = if self.eat(&TokenKind::Colon) {
            self.parse_type_name()
        } else {
            None
        };
        let body = self.parse_scope()?;
        Some(self.tree.add(
            NodeKind::Function {
                name,
                parameters,
                return_type,
                body,
                is_static,
                is_virtual,
                is_override,
                attributes,
                resolved_function: None,
            },
            location,
        ))
    }

    fn parse_constructor(&mut self, attributes: Vec<AttributeNode>) -> Option<NodeId> {
        let location = self.here();
        self.bump(); // constructor
        let parameters = self.parse_parameter_list()?;
        let body = self.parse_scope()?;
        Some(self.tree.add(
            NodeKind::Constructor {
                parameters,
                body,
                attributes,
                resolved_function: None,
            },
            location,
        ))
    }

    fn parse_destructor(&mut self) -> Option<NodeId> {
        let location = self.here();
        self.bump(); // destructor
        self.expect(&TokenKind::LeftParen, "'(' after 'destructor'");
        self.expect(&TokenKind::RightParen, "')' (destructors take no parameters)");
        let body = self.parse_scope()?;
        Some(self.tree.add(
            NodeKind::Destructor {
                body,
                resolved_function: None,
            },
            location,
        ))
    }

    fn parse_sends_event(&mut self) -> Option<NodeId> {
        let location = self.here();
        self.bump(); // sends
        let name = self.expect_identifier("an event name")?;
        self.expect(&TokenKind::Colon, "':' before the event type");
        let event_type = self.parse_type_name()?;
        self.expect(&TokenKind::Semicolon, "';' after the sends declaration");
        Some(self.tree.add(NodeKind::SendsEvent { name, event_type }, location))
    }

    fn parse_parameter_list(&mut self) -> Option<Vec<NodeId>> {
        self.expect(&TokenKind::LeftParen, "'(' to open the parameter list");
        let mut parameters = Vec::new();
        while !self.at(&TokenKind::RightParen) && !self.at(&TokenKind::EndOfFile) {
            let location = self.here();
            let name = self.expect_identifier("a parameter name")?;
            self.expect(&TokenKind::Colon, "':' before the parameter type");
            let declared_type = self.parse_type_name()?;
            parameters.push(self.tree.add(
                NodeKind::Parameter {
                    name,
                    declared_type,
                    resolved_type: None,
                },
                location,
            ));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RightParen, "')' to close the parameter list");
        Some(parameters)
    }

    // --- statements ---

    fn parse_scope(&mut self) -> Option<NodeId> {
        let location = self.here();
        self.expect(&TokenKind::LeftBrace, "'{' to open a scope");
        let mut statements = Vec::new();
        while !self.at(&TokenKind::RightBrace) && !self.at(&TokenKind::EndOfFile) {
            match self.parse_statement() {
                Some(statement) => statements.push(statement),
                None => self.synchronize(),
            }
        }
        self.expect(&TokenKind::RightBrace, "'}' to close the scope");
        Some(self.tree.add(NodeKind::Scope { statements }, location))
    }

    /// Either a braced scope or a single statement wrapped in one, so `if`
    /// bodies are uniformly scopes.
    fn parse_embedded_scope(&mut self) -> Option<NodeId> {
        if self.at(&TokenKind::LeftBrace) {
            self.parse_scope()
        } else {
            let location = self.here();
            let statement = self.parse_statement()?;
            Some(self.tree.add(
                NodeKind::Scope {
                    statements: vec![statement],
                },
                location,
            ))
        }
    }

    fn parse_statement(&mut self) -> Option<NodeId> {
        let location = self.here();
        match self.peek() {
            TokenKind::LeftBrace => self.parse_scope(),
            TokenKind::If => self.parse_if(),
            TokenKind::While => {
                self.bump();
                self.expect(&TokenKind::LeftParen, "'(' after 'while'");
                let condition = self.parse_expression()?;
                self.expect(&TokenKind::RightParen, "')' after the condition");
                let body = self.parse_embedded_scope()?;
                Some(self.tree.add(NodeKind::While { condition, body }, location))
            }
            TokenKind::Do => {
                self.bump();
                let body = self.parse_embedded_scope()?;
                self.expect(&TokenKind::While, "'while' after a do body");
                self.expect(&TokenKind::LeftParen, "'(' after 'while'");
                let condition = self.parse_expression()?;
                self.expect(&TokenKind::RightParen, "')' after the condition");
                self.expect(&TokenKind::Semicolon, "';' after a do-while");
                Some(self.tree.add(NodeKind::DoWhile { body, condition }, location))
            }
            TokenKind::For => {
                self.bump();
                self.expect(&TokenKind::LeftParen, "'(' after 'for'");
                let initializer = if self.at(&TokenKind::Semicolon) {
                    None
                } else {
                    self.parse_local_or_expression_statement_no_semicolon()
                };
                self.expect(&TokenKind::Semicolon, "';' after the for initializer");
                let condition = if self.at(&TokenKind::Semicolon) {
                    None
                } else {
                    self.parse_expression()
                };
                self.expect(&TokenKind::Semicolon, "';' after the for condition");
                let increment = if self.at(&TokenKind::RightParen) {
                    None
                } else {
                    self.parse_expression()
                };
                self.expect(&TokenKind::RightParen, "')' after the for header");
                let body = self.parse_embedded_scope()?;
                Some(self.tree.add(
                    NodeKind::For {
                        initializer,
                        condition,
                        increment,
                        body,
                    },
                    location,
                ))
            }
            TokenKind::Loop => {
                self.bump();
                let body = self.parse_embedded_scope()?;
                Some(self.tree.add(NodeKind::Loop { body }, location))
            }
            TokenKind::Break => {
                self.bump();
                self.expect(&TokenKind::Semicolon, "';' after 'break'");
                Some(self.tree.add(NodeKind::Break, location))
            }
            TokenKind::Continue => {
                self.bump();
                self.expect(&TokenKind::Semicolon, "';' after 'continue'");
                Some(self.tree.add(NodeKind::Continue, location))
            }
            TokenKind::Return => {
                self.bump();
                let value = if self.at(&TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.expect(&TokenKind::Semicolon, "';' after 'return'");
                Some(self.tree.add(NodeKind::Return { value }, location))
            }
            TokenKind::Throw => {
                self.bump();
                let value = self.parse_expression()?;
                self.expect(&TokenKind::Semicolon, "';' after 'throw'");
                Some(self.tree.add(NodeKind::Throw { value }, location))
            }
            TokenKind::Delete => {
                self.bump();
                let value = self.parse_expression()?;
                self.expect(&TokenKind::Semicolon, "';' after 'delete'");
                Some(self.tree.add(NodeKind::Delete { value }, location))
            }
            TokenKind::Timeout => {
                self.bump();
                self.expect(&TokenKind::LeftParen, "'(' after 'timeout'");
                let seconds = match self.peek().clone() {
                    TokenKind::IntegerLiteral(v) => {
                        self.bump();
                        v
                    }
                    _ => {
                        self.errors.raise(
                            self.here(),
                            DiagnosticCode::UnexpectedToken,
                            "timeout takes a whole number of seconds",
                        );
                        0
                    }
                };
                self.expect(&TokenKind::RightParen, "')' after the timeout duration");
                let body = self.parse_embedded_scope()?;
                Some(self.tree.add(NodeKind::Timeout { seconds, body }, location))
            }
            TokenKind::Var => {
                let statement = self.parse_local_variable()?;
                self.expect(&TokenKind::Semicolon, "';' after the variable");
                Some(statement)
            }
            _ => {
                let expression = self.parse_expression()?;
                self.expect(&TokenKind::Semicolon, "';' after the expression");
                Some(expression)
            }
        }
    }

    fn parse_if(&mut self) -> Option<NodeId> {
        let location = self.here();
        self.bump(); // if
        self.expect(&TokenKind::LeftParen, "'(' after 'if'");
        let condition = self.parse_expression()?;
        self.expect(&TokenKind::RightParen, "')' after the condition");
        let then_scope = self.parse_embedded_scope()?;
        let else_node = if self.eat(&TokenKind::Else) {
            if self.at(&TokenKind::If) {
                self.parse_if()
            } else {
                self.parse_embedded_scope()
            }
        } else {
            None
        };
        Some(self.tree.add(
            NodeKind::If {
                condition,
                then_scope,
                else_node,
            },
            location,
        ))
    }

    fn parse_local_variable(&mut self) -> Option<NodeId> {
        let location = self.here();
        self.bump(); // var
        let name = self.expect_identifier("a variable name")?;
        let declared_type = if self.eat(&TokenKind::Colon) {
            self.parse_type_name()
        } else {
            None
        };
        let initializer = if self.eat(&TokenKind::Assign) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        Some(self.tree.add(
            NodeKind::LocalVariable {
                name,
                declared_type,
                initializer,
                resolved_type: None,
            },
            location,
        ))
    }

    fn parse_local_or_expression_statement_no_semicolon(&mut self) -> Option<NodeId> {
        if self.at(&TokenKind::Var) {
            self.parse_local_variable()
        } else {
            self.parse_expression()
        }
    }

    // --- expressions, by descending precedence ---

    fn parse_expression(&mut self) -> Option<NodeId> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Option<NodeId> {
        let left = self.parse_logical_or()?;
        let op = match self.peek() {
            TokenKind::Assign => BinaryToken::Assign,
            TokenKind::PlusAssign => BinaryToken::CompoundAssign(BinaryOp::Add),
            TokenKind::MinusAssign => BinaryToken::CompoundAssign(BinaryOp::Subtract),
            TokenKind::StarAssign => BinaryToken::CompoundAssign(BinaryOp::Multiply),
            TokenKind::SlashAssign => BinaryToken::CompoundAssign(BinaryOp::Divide),
            TokenKind::PercentAssign => BinaryToken::CompoundAssign(BinaryOp::Modulo),
            _ => return Some(left),
        };
        let location = self.here();
        self.bump();
        let right = self.parse_assignment()?;
        Some(self.tree.add(NodeKind::BinaryOperator { op, left, right }, location))
    }

    fn parse_logical_or(&mut self) -> Option<NodeId> {
        let mut left = self.parse_logical_and()?;
        while self.at(&TokenKind::OrOr) {
            let location = self.here();
            self.bump();
            let right = self.parse_logical_and()?;
            left = self.tree.add(
                NodeKind::BinaryOperator {
                    op: BinaryToken::LogicalOr,
                    left,
                    right,
                },
                location,
            );
        }
        Some(left)
    }

    fn parse_logical_and(&mut self) -> Option<NodeId> {
        let mut left = self.parse_bitwise()?;
        while self.at(&TokenKind::AndAnd) {
            let location = self.here();
            self.bump();
            let right = self.parse_bitwise()?;
            left = self.tree.add(
                NodeKind::BinaryOperator {
                    op: BinaryToken::LogicalAnd,
                    left,
                    right,
                },
                location,
            );
        }
        Some(left)
    }

    fn parse_bitwise(&mut self) -> Option<NodeId> {
        let mut left = self.parse_equality()?;
        loop {
            let op = match self.peek() {
                TokenKind::Ampersand => BinaryOp::BitwiseAnd,
                TokenKind::Pipe => BinaryOp::BitwiseOr,
                TokenKind::Caret => BinaryOp::BitwiseXor,
                _ => return Some(left),
            };
            let location = self.here();
            self.bump();
            let right = self.parse_equality()?;
            left = self.tree.add(
                NodeKind::BinaryOperator {
                    op: BinaryToken::Arith(op),
                    left,
                    right,
                },
                location,
            );
        }
    }

    fn parse_equality(&mut self) -> Option<NodeId> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                TokenKind::Equal => BinaryOp::Equal,
                TokenKind::NotEqual => BinaryOp::NotEqual,
                _ => return Some(left),
            };
            let location = self.here();
            self.bump();
            let right = self.parse_relational()?;
            left = self.tree.add(
                NodeKind::BinaryOperator {
                    op: BinaryToken::Arith(op),
                    left,
                    right,
                },
                location,
            );
        }
    }

    fn parse_relational(&mut self) -> Option<NodeId> {
        let mut left = self.parse_shift()?;
        loop {
            match self.peek() {
                TokenKind::As => {
                    let location = self.here();
                    self.bump();
                    let target = self.parse_type_name()?;
                    left = self.tree.add(
                        NodeKind::TypeCast {
                            operand: left,
                            target: Some(target),
                            operator: None,
                        },
                        location,
                    );
                }
                TokenKind::Less | TokenKind::LessEqual | TokenKind::Greater | TokenKind::GreaterEqual => {
                    let op = match self.peek() {
                        TokenKind::Less => BinaryOp::Less,
                        TokenKind::LessEqual => BinaryOp::LessEqual,
                        TokenKind::Greater => BinaryOp::Greater,
                        _ => BinaryOp::GreaterEqual,
                    };
                    let location = self.here();
                    self.bump();
                    let right = self.parse_shift()?;
                    left = self.tree.add(
                        NodeKind::BinaryOperator {
                            op: BinaryToken::Arith(op),
                            left,
                            right,
                        },
                        location,
                    );
                }
                _ => return Some(left),
            }
        }
    }

    fn parse_shift(&mut self) -> Option<NodeId> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                TokenKind::LessLess => BinaryOp::ShiftLeft,
                TokenKind::GreaterGreater => BinaryOp::ShiftRight,
                _ => return Some(left),
            };
            let location = self.here();
            self.bump();
            let right = self.parse_additive()?;
            left = self.tree.add(
                NodeKind::BinaryOperator {
                    op: BinaryToken::Arith(op),
                    left,
                    right,
                },
                location,
            );
        }
    }

    fn parse_additive(&mut self) -> Option<NodeId> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Subtract,
                _ => return Some(left),
            };
            let location = self.here();
            self.bump();
            let right = self.parse_multiplicative()?;
            left = self.tree.add(
                NodeKind::BinaryOperator {
                    op: BinaryToken::Arith(op),
                    left,
                    right,
                },
                location,
            );
        }
    }

    fn parse_multiplicative(&mut self) -> Option<NodeId> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinaryOp::Multiply,
                TokenKind::Slash => BinaryOp::Divide,
                TokenKind::Percent => BinaryOp::Modulo,
                _ => return Some(left),
            };
            let location = self.here();
            self.bump();
            let right = self.parse_unary()?;
            left = self.tree.add(
                NodeKind::BinaryOperator {
                    op: BinaryToken::Arith(op),
                    left,
                    right,
                },
                location,
            );
        }
    }

    fn parse_unary(&mut self) -> Option<NodeId> {
        let op = match self.peek() {
            TokenKind::Minus => Some(UnaryOp::Negate),
            TokenKind::Bang => Some(UnaryOp::LogicalNot),
            TokenKind::Tilde => Some(UnaryOp::BitwiseNot),
            TokenKind::PlusPlus => Some(UnaryOp::Increment),
            TokenKind::MinusMinus => Some(UnaryOp::Decrement),
            _ => None,
        };
        if let Some(op) = op {
            let location = self.here();
            self.bump();
            let operand = self.parse_unary()?;
            return Some(self.tree.add(NodeKind::UnaryOperator { op, operand }, location));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Option<NodeId> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                TokenKind::Dot => {
                    let location = self.here();
                    self.bump();
                    let name = self.expect_identifier("a member name")?;
                    expr = self.tree.add(
                        NodeKind::MemberAccess {
                            object: expr,
                            name,
                            resolved: None,
                        },
                        location,
                    );
                }
                TokenKind::LeftParen => {
                    let location = self.here();
                    let arguments = self.parse_argument_list()?;
                    expr = self.tree.add(
                        NodeKind::FunctionCall {
                            callee: expr,
                            arguments,
                            resolved_function: None,
                        },
                        location,
                    );
                }
                TokenKind::LeftBracket => {
                    let location = self.here();
                    self.bump();
                    let mut arguments = Vec::new();
                    loop {
                        arguments.push(self.parse_expression()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RightBracket, "']' after indexer arguments");
                    expr = self.tree.add(NodeKind::IndexerCall { object: expr, arguments }, location);
                }
                _ => return Some(expr),
            }
        }
    }

    fn parse_argument_list(&mut self) -> Option<Vec<NodeId>> {
        self.expect(&TokenKind::LeftParen, "'(' to open the argument list");
        let mut arguments = Vec::new();
        while !self.at(&TokenKind::RightParen) && !self.at(&TokenKind::EndOfFile) {
            arguments.push(self.parse_expression()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RightParen, "')' to close the argument list");
        Some(arguments)
    }

    fn parse_primary(&mut self) -> Option<NodeId> {
        let location = self.here();
        match self.peek().clone() {
            TokenKind::IntegerLiteral(v) => {
                self.bump();
                Some(self.tree.add(
                    NodeKind::Literal {
                        constant: Constant::Integer(v),
                    },
                    location,
                ))
            }
            TokenKind::RealLiteral(v) => {
                self.bump();
                Some(self.tree.add(
                    NodeKind::Literal {
                        constant: Constant::Real(v),
                    },
                    location,
                ))
            }
            TokenKind::StringLiteral(segments) => {
                self.bump();
                self.build_string_literal(&segments, location)
            }
            TokenKind::True => {
                self.bump();
                Some(self.tree.add(
                    NodeKind::Literal {
                        constant: Constant::Boolean(true),
                    },
                    location,
                ))
            }
            TokenKind::False => {
                self.bump();
                Some(self.tree.add(
                    NodeKind::Literal {
                        constant: Constant::Boolean(false),
                    },
                    location,
                ))
            }
            TokenKind::Null => {
                self.bump();
                Some(self.tree.add(NodeKind::Null, location))
            }
            TokenKind::This => {
                self.bump();
                Some(self.tree.add(NodeKind::This, location))
            }
            TokenKind::New => {
                self.bump();
                let type_name = self.parse_type_name()?;
                let arguments = self.parse_argument_list()?;
                Some(self.tree.add(
                    NodeKind::New {
                        type_name,
                        arguments,
                        resolved_constructor: None,
                    },
                    location,
                ))
            }
            TokenKind::Local => {
                self.bump();
                let type_name = self.parse_type_name()?;
                let arguments = self.parse_argument_list()?;
                Some(self.tree.add(
                    NodeKind::LocalNew {
                        type_name,
                        arguments,
                        resolved_constructor: None,
                    },
                    location,
                ))
            }
            TokenKind::TypeIdKeyword => {
                self.bump();
                self.expect(&TokenKind::LeftParen, "'(' after 'typeid'");
                let expression = self.parse_expression()?;
                self.expect(&TokenKind::RightParen, "')' after 'typeid'");
                Some(self.tree.add(NodeKind::TypeIdExpr { expression }, location))
            }
            TokenKind::MemberIdKeyword => {
                self.bump();
                self.expect(&TokenKind::LeftParen, "'(' after 'memberid'");
                let expression = self.parse_expression()?;
                self.expect(&TokenKind::RightParen, "')' after 'memberid'");
                Some(self.tree.add(NodeKind::MemberIdExpr { expression }, location))
            }
            TokenKind::Identifier(name) => {
                self.bump();
                Some(self.tree.add(NodeKind::Identifier { name, resolved: None }, location))
            }
            TokenKind::LeftParen => {
                self.bump();
                let inner = self.parse_expression()?;
                self.expect(&TokenKind::RightParen, "')' to close the parenthesized expression");
                Some(inner)
            }
            other => {
                let found: &'static str = (&other).into();
                self.errors.raise(
                    location,
                    DiagnosticCode::UnexpectedToken,
                    format!("expected an expression, found {found}"),
                );
                None
            }
        }
    }

    /// Turns a lexed string literal into either a plain literal node or a
    /// string interpolant whose splices are parsed in place.
    fn build_string_literal(&mut self, segments: &[StringSegment], location: CodeLocation) -> Option<NodeId> {
        let has_splice = segments.iter().any(|s| matches!(s, StringSegment::Splice { .. }));
        if !has_splice {
            let mut text = String::new();
            for segment in segments {
                if let StringSegment::Text(t) = segment {
                    text.push_str(t);
                }
            }
            return Some(self.tree.add(
                NodeKind::Literal {
                    constant: Constant::Str(text),
                },
                location,
            ));
        }
        let mut parts = Vec::new();
        for segment in segments {
            match segment {
                StringSegment::Text(text) => {
                    if !text.is_empty() {
                        parts.push(self.tree.add(
                            NodeKind::Literal {
                                constant: Constant::Str(text.clone()),
                            },
                            location.clone(),
                        ));
                    }
                }
                StringSegment::Splice {
                    source,
                    location: splice_location,
                } => {
                    let tokens = tokenize(&splice_location.origin, source, self.errors);
                    let mut sub_parser = Parser {
                        tokens,
                        position: 0,
                        tree: &mut *self.tree,
                        errors: &mut *self.errors,
                    };
                    if let Some(expr) = sub_parser.parse_expression() {
                        parts.push(expr);
                    }
                }
            }
        }
        Some(self.tree.add(NodeKind::StringInterpolant { parts }, location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::ast::NodeKind;

    fn parse_ok(code: &str) -> SyntaxTree {
        let mut errors = CompilationErrors::new();
        let tree = parse_entries(&[CodeEntry::new(code, "test.lus")], &mut errors);
        assert!(errors.is_empty(), "unexpected parse errors: {:?}", errors.events());
        tree
    }

    fn root_items(tree: &SyntaxTree) -> Vec<NodeId> {
        match tree.kind(tree.root) {
            NodeKind::Root { items } => items.clone(),
            other => panic!("root is {other:?}"),
        }
    }

    #[test]
    fn parses_factorial() {
        let tree = parse_ok(
            "function Factorial(n : Integer) : Integer\
             { if (n <= 1) return 1; return n * Factorial(n - 1); }",
        );
        let items = root_items(&tree);
        assert_eq!(items.len(), 1);
        let NodeKind::Function { name, parameters, .. } = tree.kind(items[0]) else {
            panic!("expected a function");
        };
        assert_eq!(name, "Factorial");
        assert_eq!(parameters.len(), 1);
    }

    #[test]
    fn parses_class_with_members() {
        let tree = parse_ok(
            "class Animal\
             {\
                 var Name : String = \"unnamed\";\
                 constructor() { }\
                 function Speak() { }\
             }",
        );
        let items = root_items(&tree);
        let NodeKind::Class { name, members, .. } = tree.kind(items[0]) else {
            panic!("expected a class");
        };
        assert_eq!(name, "Animal");
        assert_eq!(members.len(), 3);
    }

    #[test]
    fn parses_template_class_and_type_args() {
        let tree = parse_ok(
            "class Stack[T] { var Count : Integer; }\
             var s : Stack[Integer] = new Stack[Integer]();",
        );
        let items = root_items(&tree);
        let NodeKind::Class { template_params, .. } = tree.kind(items[0]) else {
            panic!("expected a class");
        };
        assert_eq!(template_params, &["T".to_owned()]);
        let NodeKind::LocalVariable { declared_type, .. } = tree.kind(items[1]) else {
            panic!("expected a variable");
        };
        let declared = declared_type.as_ref().unwrap();
        assert_eq!(declared.name, "Stack");
        assert!(matches!(&declared.template_args[0], TypeNameArg::Type(arg) if arg.name == "Integer"));
    }

    #[test]
    fn parses_timeout_and_loops() {
        let tree = parse_ok("timeout (1) { while (true) { } }");
        let items = root_items(&tree);
        let NodeKind::Timeout { seconds, .. } = tree.kind(items[0]) else {
            panic!("expected a timeout");
        };
        assert_eq!(*seconds, 1);
    }

    #[test]
    fn parses_interpolated_string() {
        let tree = parse_ok("var s : String = \"value: `1 + 2`\";");
        let items = root_items(&tree);
        let NodeKind::LocalVariable { initializer, .. } = tree.kind(items[0]) else {
            panic!("expected a variable");
        };
        let NodeKind::StringInterpolant { parts } = tree.kind(initializer.unwrap()) else {
            panic!("expected an interpolant");
        };
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn attributes_on_class() {
        let tree = parse_ok("[Vertex][Name(\"core\")] class V { }");
        let items = root_items(&tree);
        let NodeKind::Class { attributes, .. } = tree.kind(items[0]) else {
            panic!("expected a class");
        };
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes[1].parameters, vec![Constant::Str("core".to_owned())]);
    }

    #[test]
    fn error_recovery_keeps_later_items() {
        let mut errors = CompilationErrors::new();
        let tree = parse_entries(
            &[CodeEntry::new("var x : = ;\nvar y : Integer = 2;", "test.lus")],
            &mut errors,
        );
        assert!(errors.was_error);
        // The second declaration still parsed.
        let items = root_items(&tree);
        assert!(
            items
                .iter()
                .any(|&id| matches!(tree.kind(id), NodeKind::LocalVariable { name, .. } if name == "y"))
        );
    }
}
