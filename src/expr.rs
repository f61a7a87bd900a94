//! Operand expressions of breakpoint parameters.
//!
//! An operand is a string such as `"ecx"`, `"[esp+0x10]"` or
//! `"[[ebp-8]+4] & 0xffff"`, or a JSON number. Registers are case-insensitive.
//! Arithmetic wraps at 32 bits and follows C precedence; `>>` is a logical
//! shift; `[x]` reads the dword at `x`.

use serde_json::Value;
use thiserror::Error;

use crate::mem::Memory;
use crate::x86::{Reg, Registers};

/// Why an operand can't be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    /// A name that isn't a register
    #[error("unknown register `{0}`")]
    UnknownRegister(String),

    /// A character that doesn't fit the grammar at its position
    #[error("unexpected `{0}` at offset {1}")]
    Unexpected(char, usize),

    /// The text ends in the middle of an expression
    #[error("unexpected end of expression")]
    UnexpectedEnd,

    /// A literal that doesn't fit in 32 bits
    #[error("bad number `{0}`")]
    BadNumber(String),

    /// Neither a string nor a number
    #[error("operand must be a string or a number")]
    NotAnOperand,

    /// Brackets, parentheses or unary operators nest too deep
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
}

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Or,
    Xor,
    And,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinOp {
    // Higher binds tighter.
    fn precedence(self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::Xor => 2,
            BinOp::And => 3,
            BinOp::Shl | BinOp::Shr => 4,
            BinOp::Add | BinOp::Sub => 5,
            BinOp::Mul | BinOp::Div | BinOp::Rem => 6,
        }
    }

    fn apply(self, l: u32, r: u32) -> Option<u32> {
        let v = match self {
            BinOp::Or => l | r,
            BinOp::Xor => l ^ r,
            BinOp::And => l & r,
            BinOp::Shl => l.wrapping_shl(r),
            BinOp::Shr => l.wrapping_shr(r),
            BinOp::Add => l.wrapping_add(r),
            BinOp::Sub => l.wrapping_sub(r),
            BinOp::Mul => l.wrapping_mul(r),
            BinOp::Div => {
                if r == 0 {
                    return None;
                }
                (l as i32).wrapping_div(r as i32) as u32
            }
            BinOp::Rem => {
                if r == 0 {
                    return None;
                }
                (l as i32).wrapping_rem(r as i32) as u32
            }
        };
        Some(v)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Num(u32),
    Reg(Reg),
    Deref(Box<Node>),
    Neg(Box<Node>),
    Not(Box<Node>),
    Bin(BinOp, Box<Node>, Box<Node>),
}

impl Node {
    fn eval(&self, regs: &Registers, mem: &dyn Memory) -> Option<u32> {
        match self {
            Node::Num(n) => Some(*n),
            Node::Reg(r) => Some(regs.get(*r)),
            Node::Deref(inner) => {
                let addr = inner.eval(regs, mem)?;
                if addr == 0 {
                    return None;
                }
                mem.read_u32(addr)
            }
            Node::Neg(inner) => Some(inner.eval(regs, mem)?.wrapping_neg()),
            Node::Not(inner) => Some(!inner.eval(regs, mem)?),
            Node::Bin(op, l, r) => op.apply(l.eval(regs, mem)?, r.eval(regs, mem)?),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Num(u32),
    Ident(String),
    Op(BinOp),
    Tilde,
    LBracket,
    RBracket,
    LParen,
    RParen,
}

fn tokenize(text: &str) -> Result<Vec<(Token, usize)>, ExprError> {
    let bytes = text.as_bytes();
    let mut tokens = vec![];
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        let start = i;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() {
            while i < bytes.len() && bytes[i].is_ascii_alphanumeric() {
                i += 1;
            }
            let lit = &text[start..i];
            let parsed = match lit.strip_prefix("0x").or_else(|| lit.strip_prefix("0X")) {
                Some(hex) => u32::from_str_radix(hex, 16),
                None => lit.parse::<u32>(),
            };
            let n = parsed.map_err(|_| ExprError::BadNumber(lit.to_owned()))?;
            tokens.push((Token::Num(n), start));
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push((Token::Ident(text[start..i].to_owned()), start));
            continue;
        }
        let tok = match c {
            '<' | '>' => {
                if bytes.get(i + 1) != Some(&bytes[i]) {
                    return Err(ExprError::Unexpected(c, i));
                }
                i += 1;
                Token::Op(if c == '<' { BinOp::Shl } else { BinOp::Shr })
            }
            '|' => Token::Op(BinOp::Or),
            '^' => Token::Op(BinOp::Xor),
            '&' => Token::Op(BinOp::And),
            '+' => Token::Op(BinOp::Add),
            '-' => Token::Op(BinOp::Sub),
            '*' => Token::Op(BinOp::Mul),
            '/' => Token::Op(BinOp::Div),
            '%' => Token::Op(BinOp::Rem),
            '~' => Token::Tilde,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '(' => Token::LParen,
            ')' => Token::RParen,
            _ => {
                // report the whole char, not a utf-8 fragment
                let ch = text[i..].chars().next().unwrap_or(c);
                return Err(ExprError::Unexpected(ch, i));
            }
        };
        i += 1;
        tokens.push((tok, start));
    }
    Ok(tokens)
}

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ExprError>,
    ) -> Result<T, ExprError> {
        if self.depth >= MAX_DEPTH {
            return Err(ExprError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let ret = f(self);
        self.depth -= 1;
        ret
    }

    fn unexpected(&self, at: usize) -> ExprError {
        ExprError::Unexpected(self.text[at..].chars().next().unwrap_or('?'), at)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Result<(Token, usize), ExprError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ExprError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(tok)
    }

    fn expect(&mut self, want: Token) -> Result<(), ExprError> {
        let (tok, at) = self.next()?;
        if tok == want {
            Ok(())
        } else {
            Err(self.unexpected(at))
        }
    }

    fn binary(&mut self, min_prec: u8) -> Result<Node, ExprError> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            if op.precedence() < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.binary(op.precedence() + 1)?;
            lhs = Node::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Node, ExprError> {
        match self.peek() {
            Some(Token::Op(BinOp::Sub)) => {
                self.pos += 1;
                Ok(Node::Neg(Box::new(self.nested(Self::unary)?)))
            }
            Some(Token::Tilde) => {
                self.pos += 1;
                Ok(Node::Not(Box::new(self.nested(Self::unary)?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Node, ExprError> {
        let (tok, at) = self.next()?;
        match tok {
            Token::Num(n) => Ok(Node::Num(n)),
            Token::Ident(name) => Ok(Node::Reg(name.parse()?)),
            Token::LBracket => {
                let inner = self.nested(|p| p.binary(0))?;
                self.expect(Token::RBracket)?;
                Ok(Node::Deref(Box::new(inner)))
            }
            Token::LParen => {
                let inner = self.nested(|p| p.binary(0))?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            _ => Err(self.unexpected(at)),
        }
    }
}

/// A parsed operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operand {
    root: Node,
}

impl Operand {
    /// Parses operand text.
    pub fn parse(text: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            text,
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.binary(0)?;
        if let Some((_, at)) = parser.tokens.get(parser.pos) {
            return Err(parser.unexpected(*at));
        }
        Ok(Self { root })
    }

    /// Parses a JSON operand: a string expression, or an integer literal.
    pub fn from_json(value: &Value) -> Result<Self, ExprError> {
        match value {
            Value::String(s) => Self::parse(s),
            Value::Number(n) => {
                let v = n
                    .as_i64()
                    .filter(|v| *v >= i64::from(i32::MIN) && *v <= i64::from(u32::MAX))
                    .ok_or_else(|| ExprError::BadNumber(n.to_string()))?;
                Ok(Self {
                    root: Node::Num(v as u32),
                })
            }
            _ => Err(ExprError::NotAnOperand),
        }
    }

    /// The register, if the operand is nothing but a register name.
    pub fn as_register(&self) -> Option<Reg> {
        match self.root {
            Node::Reg(r) => Some(r),
            _ => None,
        }
    }

    /// Evaluates the operand. `None` if a dereference fails or a division by
    /// zero happens.
    pub fn eval(&self, regs: &Registers, mem: &dyn Memory) -> Option<u32> {
        self.root.eval(regs, mem)
    }
}

/// Resolves a bare register operand to its slot in `regs`.
pub fn register_pointer<'a>(regs: &'a mut Registers, value: &Value) -> Option<&'a mut u32> {
    let reg = Operand::from_json(value).ok()?.as_register()?;
    Some(regs.slot_mut(reg))
}

/// Resolves an operand to a non-null address.
pub fn pointer(regs: &Registers, mem: &dyn Memory, value: &Value) -> Option<u32> {
    Operand::from_json(value)
        .ok()?
        .eval(regs, mem)
        .filter(|addr| *addr != 0)
}

/// Resolves an operand to a signed value.
pub fn immediate(regs: &Registers, mem: &dyn Memory, value: &Value) -> Option<i32> {
    Operand::from_json(value)
        .ok()?
        .eval(regs, mem)
        .map(|v| v as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::testing::FakeMemory;
    use serde_json::json;

    fn regs() -> Registers {
        Registers {
            eax: 0x10,
            ecx: 0x2000,
            esp: 0x0019_ff00,
            ebp: 0x0019_ff40,
            esi: 0xffff_fff0,
            retaddr: 0x0040_1005,
            ..Default::default()
        }
    }

    fn eval(text: &str, mem: &FakeMemory) -> Option<u32> {
        Operand::parse(text).unwrap().eval(&regs(), mem)
    }

    #[test]
    fn test_register_pointer_reads_snapshot() {
        let mut r = regs();
        for (name, want) in [("eax", 0x10), ("ECX", 0x2000), ("RetAddr", 0x0040_1005)] {
            let slot = register_pointer(&mut r, &json!(name)).unwrap();
            assert_eq!(*slot, want);
        }
        *register_pointer(&mut r, &json!("ebx")).unwrap() = 7;
        assert_eq!(r.ebx, 7);
        // only a bare register has a slot
        assert!(register_pointer(&mut r, &json!("eax+0")).is_none());
        assert!(register_pointer(&mut r, &json!(12)).is_none());
    }

    #[test]
    fn test_reg_plus_const_is_pointer_arithmetic() {
        let mem = FakeMemory::default();
        let r = regs();
        assert_eq!(pointer(&r, &mem, &json!("esp+0x10")), Some(r.esp + 0x10));
        assert_eq!(pointer(&r, &mem, &json!("ebp - 8")), Some(r.ebp - 8));
        assert_eq!(pointer(&r, &mem, &json!("esi + 0x20")), Some(0x10));
    }

    #[test]
    fn test_precedence() {
        let mem = FakeMemory::default();
        assert_eq!(eval("1 + 2 * 3", &mem), Some(7));
        assert_eq!(eval("(1 + 2) * 3", &mem), Some(9));
        assert_eq!(eval("1 << 4 + 1", &mem), Some(32));
        assert_eq!(eval("0xf0 | 0x0f & 0x3", &mem), Some(0xf3));
        assert_eq!(eval("6 ^ 3 & 1", &mem), Some(7));
        assert_eq!(eval("10 - 4 - 3", &mem), Some(3));
        assert_eq!(eval("-eax", &mem), Some(0xffff_fff0));
        assert_eq!(eval("~0", &mem), Some(0xffff_ffff));
        assert_eq!(eval("-7 / 2", &mem), Some(-3i32 as u32));
        assert_eq!(eval("-7 % 2", &mem), Some(-1i32 as u32));
        assert_eq!(eval("0x80000000 >> 31", &mem), Some(1));
    }

    #[test]
    fn test_dereference_chain() {
        let mem = FakeMemory::default();
        let r = regs();
        mem.put_u32(r.esp + 4, 0x0030_0000);
        mem.put_u32(0x0030_0008, 0xdead_beef);
        assert_eq!(eval("[esp+4]", &mem), Some(0x0030_0000));
        assert_eq!(eval("[[esp+4]+8]", &mem), Some(0xdead_beef));
        assert_eq!(eval("[[esp+4]+8] & 0xffff", &mem), Some(0xbeef));
        // unmapped or null
        assert_eq!(eval("[ecx]", &mem), None);
        assert_eq!(eval("[0]", &mem), None);
    }

    #[test]
    fn test_immediate() {
        let mem = FakeMemory::default();
        let r = regs();
        assert_eq!(immediate(&r, &mem, &json!("eax * 2")), Some(0x20));
        assert_eq!(immediate(&r, &mem, &json!("esi")), Some(-16));
        assert_eq!(immediate(&r, &mem, &json!(-5)), Some(-5));
        assert_eq!(immediate(&r, &mem, &json!(0xffff_ffffu32)), Some(-1));
        assert_eq!(immediate(&r, &mem, &json!("1 / 0")), None);
    }

    #[test]
    fn test_pointer_rejects_null() {
        let mem = FakeMemory::default();
        let r = regs();
        assert_eq!(pointer(&r, &mem, &json!("eax - 0x10")), None);
        assert_eq!(pointer(&r, &mem, &json!(0)), None);
        assert_eq!(pointer(&r, &mem, &json!(0x1234)), Some(0x1234));
    }

    #[test]
    fn test_malformed() {
        assert_eq!(
            Operand::parse("rax"),
            Err(ExprError::UnknownRegister("rax".into()))
        );
        assert_eq!(Operand::parse(""), Err(ExprError::UnexpectedEnd));
        assert_eq!(Operand::parse("[eax"), Err(ExprError::UnexpectedEnd));
        assert_eq!(Operand::parse("eax ]"), Err(ExprError::Unexpected(']', 4)));
        assert_eq!(Operand::parse("eax < 2"), Err(ExprError::Unexpected('<', 4)));
        assert_eq!(Operand::parse("eax $ 2"), Err(ExprError::Unexpected('$', 4)));
        assert_eq!(Operand::parse("0x1g"), Err(ExprError::BadNumber("0x1g".into())));
        assert_eq!(
            Operand::parse("4294967296"),
            Err(ExprError::BadNumber("4294967296".into()))
        );
        assert_eq!(Operand::from_json(&json!(true)), Err(ExprError::NotAnOperand));
        assert_eq!(Operand::from_json(&json!(1.5)), Err(ExprError::BadNumber("1.5".into())));

        let mem = FakeMemory::default();
        // every failure reads as an absent parameter
        assert_eq!(pointer(&regs(), &mem, &json!("eax +")), None);
        assert_eq!(immediate(&regs(), &mem, &json!(null)), None);
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}eax{}", "[".repeat(10_000), "]".repeat(10_000));
        assert_eq!(Operand::parse(&deep), Err(ExprError::TooDeep(MAX_DEPTH)));
        let negs = format!("{}1", "-~".repeat(5_000));
        assert_eq!(Operand::parse(&negs), Err(ExprError::TooDeep(MAX_DEPTH)));

        let ok = format!("{}eax{}", "(".repeat(MAX_DEPTH), ")".repeat(MAX_DEPTH));
        assert!(Operand::parse(&ok).is_ok());
        let over = format!("{}eax{}", "(".repeat(MAX_DEPTH + 1), ")".repeat(MAX_DEPTH + 1));
        assert_eq!(Operand::parse(&over), Err(ExprError::TooDeep(MAX_DEPTH)));
    }
}
