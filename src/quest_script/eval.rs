//! Restricted expression evaluator for the `eval` verb (spec §4.9/§9). A
//! hand-written recursive-descent parser over a whitelisted grammar: never
//! reuses a host eval facility.

use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Str(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EvalError {
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token: {0}")]
    UnexpectedToken(String),
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    #[error("disallowed identifier: {0}")]
    Disallowed(String),
    #[error("type error in expression")]
    TypeError,
    #[error("division by zero")]
    DivByZero,
}

/// Substitutes `{name}` placeholders using `vars`, then evaluates the
/// resulting expression. Result is always stored as a string (spec §4.9).
pub fn eval_expr(expr: &str, vars: &HashMap<String, String>) -> Result<String, EvalError> {
    let substituted = substitute(expr, vars);
    let tokens = tokenize(&substituted)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.parse_expr(vars)?;
    if parser.pos != parser.tokens.len() {
        return Err(EvalError::UnexpectedToken(format!("{:?}", parser.tokens[parser.pos])));
    }
    Ok(value.to_string())
}

fn substitute(expr: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::new();
    let mut chars = expr.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            let mut name = String::new();
            let mut closed = false;
            for c2 in chars.by_ref() {
                if c2 == '}' {
                    closed = true;
                    break;
                }
                name.push(c2);
            }
            if closed {
                if let Some(v) = vars.get(&name) {
                    out.push_str(v);
                } else {
                    out.push('{');
                    out.push_str(&name);
                    out.push('}');
                }
            } else {
                out.push('{');
                out.push_str(&name);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    SlashSlash,
    Percent,
    LParen,
    RParen,
    Comma,
}

fn tokenize(s: &str) -> Result<Vec<Token>, EvalError> {
    let mut out = Vec::new();
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '+' => {
                out.push(Token::Plus);
                i += 1;
            }
            '-' => {
                out.push(Token::Minus);
                i += 1;
            }
            '*' => {
                out.push(Token::Star);
                i += 1;
            }
            '/' => {
                if chars.get(i + 1) == Some(&'/') {
                    out.push(Token::SlashSlash);
                    i += 2;
                } else {
                    return Err(EvalError::UnexpectedToken("/".into()));
                }
            }
            '%' => {
                out.push(Token::Percent);
                i += 1;
            }
            '(' => {
                out.push(Token::LParen);
                i += 1;
            }
            ')' => {
                out.push(Token::RParen);
                i += 1;
            }
            ',' => {
                out.push(Token::Comma);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut lit = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    lit.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(EvalError::UnexpectedEnd);
                }
                i += 1;
                out.push(Token::Str(lit));
            }
            _ if c.is_ascii_digit() => {
                let mut num = String::new();
                while i < chars.len() && chars[i].is_ascii_digit() {
                    num.push(chars[i]);
                    i += 1;
                }
                out.push(Token::Int(num.parse().map_err(|_| EvalError::TypeError)?));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    ident.push(chars[i]);
                    i += 1;
                }
                out.push(Token::Ident(ident));
            }
            _ => return Err(EvalError::UnexpectedToken(c.to_string())),
        }
    }
    Ok(out)
}

const ALLOWED_FUNCS: [&str; 4] = ["int", "str", "len", "abs"];

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_expr(&mut self, vars: &HashMap<String, String>) -> Result<Value, EvalError> {
        let mut lhs = self.parse_term(vars)?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.next();
                    let rhs = self.parse_term(vars)?;
                    lhs = add(lhs, rhs)?;
                }
                Some(Token::Minus) => {
                    self.next();
                    let rhs = self.parse_term(vars)?;
                    lhs = Value::Int(as_int(&lhs)? - as_int(&rhs)?);
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_term(&mut self, vars: &HashMap<String, String>) -> Result<Value, EvalError> {
        let mut lhs = self.parse_unary(vars)?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.next();
                    let rhs = self.parse_unary(vars)?;
                    lhs = Value::Int(as_int(&lhs)? * as_int(&rhs)?);
                }
                Some(Token::SlashSlash) => {
                    self.next();
                    let rhs = self.parse_unary(vars)?;
                    let divisor = as_int(&rhs)?;
                    if divisor == 0 {
                        return Err(EvalError::DivByZero);
                    }
                    lhs = Value::Int(as_int(&lhs)?.div_euclid(divisor));
                }
                Some(Token::Percent) => {
                    self.next();
                    let rhs = self.parse_unary(vars)?;
                    let divisor = as_int(&rhs)?;
                    if divisor == 0 {
                        return Err(EvalError::DivByZero);
                    }
                    lhs = Value::Int(as_int(&lhs)?.rem_euclid(divisor));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self, vars: &HashMap<String, String>) -> Result<Value, EvalError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.next();
            let v = self.parse_unary(vars)?;
            return Ok(Value::Int(-as_int(&v)?));
        }
        self.parse_atom(vars)
    }

    fn parse_atom(&mut self, vars: &HashMap<String, String>) -> Result<Value, EvalError> {
        match self.next().ok_or(EvalError::UnexpectedEnd)? {
            Token::Int(i) => Ok(Value::Int(i)),
            Token::Str(s) => Ok(Value::Str(s)),
            Token::LParen => {
                let v = self.parse_expr(vars)?;
                match self.next() {
                    Some(Token::RParen) => Ok(v),
                    _ => Err(EvalError::UnexpectedToken("expected )".into())),
                }
            }
            Token::Ident(name) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    if !ALLOWED_FUNCS.contains(&name.as_str()) {
                        return Err(EvalError::Disallowed(name));
                    }
                    self.next();
                    let arg = self.parse_expr(vars)?;
                    match self.next() {
                        Some(Token::RParen) => {}
                        _ => return Err(EvalError::UnexpectedToken("expected )".into())),
                    }
                    return apply_func(&name, arg);
                }
                vars.get(&name)
                    .map(|s| Value::Str(s.clone()))
                    .ok_or(EvalError::UnknownVariable(name))
            }
            other => Err(EvalError::UnexpectedToken(format!("{other:?}"))),
        }
    }
}

fn apply_func(name: &str, arg: Value) -> Result<Value, EvalError> {
    match name {
        "int" => Ok(Value::Int(as_int(&arg)?)),
        "str" => Ok(Value::Str(arg.to_string())),
        "len" => match arg {
            Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::Int(_) => Err(EvalError::TypeError),
        },
        "abs" => Ok(Value::Int(as_int(&arg)?.abs())),
        _ => Err(EvalError::Disallowed(name.to_string())),
    }
}

fn as_int(v: &Value) -> Result<i64, EvalError> {
    match v {
        Value::Int(i) => Ok(*i),
        Value::Str(s) => s.trim().parse().map_err(|_| EvalError::TypeError),
    }
}

fn add(a: Value, b: Value) -> Result<Value, EvalError> {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
        (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
        (Value::Str(a), Value::Int(b)) => Ok(Value::Str(a + &b.to_string())),
        (Value::Int(a), Value::Str(b)) => Ok(Value::Str(a.to_string() + &b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn arithmetic_with_substitution() {
        let v = vars(&[("lvl", "4")]);
        assert_eq!(eval_expr("{lvl} + 1", &v).unwrap(), "5");
    }

    #[test]
    fn integer_floor_division_and_modulo() {
        let v = vars(&[]);
        assert_eq!(eval_expr("7 // 2", &v).unwrap(), "3");
        assert_eq!(eval_expr("7 % 2", &v).unwrap(), "1");
    }

    #[test]
    fn unary_minus_and_precedence() {
        let v = vars(&[]);
        assert_eq!(eval_expr("2 + 3 * -2", &v).unwrap(), "-4");
    }

    #[test]
    fn whitelisted_functions_work() {
        let v = vars(&[("name", "hello")]);
        assert_eq!(eval_expr("len({name})", &v).unwrap(), "5");
        assert_eq!(eval_expr("abs(-5)", &v).unwrap(), "5");
    }

    #[test]
    fn disallowed_identifier_is_rejected() {
        let v = vars(&[]);
        let err = eval_expr("eval(1)", &v).unwrap_err();
        assert_eq!(err, EvalError::Disallowed("eval".to_string()));
    }

    #[test]
    fn unknown_variable_is_an_error() {
        let v = vars(&[]);
        assert_eq!(eval_expr("missing + 1", &v).unwrap_err(), EvalError::UnknownVariable("missing".into()));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let v = vars(&[]);
        assert_eq!(eval_expr("1 // 0", &v).unwrap_err(), EvalError::DivByZero);
    }
}
