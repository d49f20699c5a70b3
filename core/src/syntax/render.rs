//! Canonical source renderer backing `tarn fmt`: one statement per line,
//! stable spacing, trailing newline. Formatting is purely syntactic; the
//! output parses back to the same tree shape.

use super::ast::{BinOp, JumpKind, Literal, Node, SuffixOp, TypeOp, UnOp};

pub fn render(stmts: &[&Node<'_>]) -> String {
    let mut out = String::new();
    for stmt in stmts {
        render_node(stmt, &mut out, 0);
        out.push_str(";\n");
    }
    out
}

fn indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str("    ");
    }
}

fn bin_op_text(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::DivFloor => "//",
        BinOp::Rem => "%",
        BinOp::Pow => "**",
        BinOp::LShift => "<<",
        BinOp::RShift => ">>",
        BinOp::BitAnd => "&",
        BinOp::BitOr => "|",
        BinOp::BitXor => "^",
        BinOp::Equal => "==",
        BinOp::NotEqual => "!=",
        BinOp::Less => "<",
        BinOp::LessEq => "<=",
        BinOp::Greater => ">",
        BinOp::GreaterEq => ">=",
        BinOp::In => "in",
        BinOp::And => "and",
        BinOp::Or => "or",
        BinOp::Range => ":",
    }
}

fn render_list(items: &[&Node<'_>], out: &mut String, level: usize) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        render_node(item, out, level);
    }
}

fn render_node(node: &Node<'_>, out: &mut String, level: usize) {
    use core::fmt::Write;

    match node {
        Node::Literal { value, .. } => match value {
            Literal::Null => out.push_str("null"),
            Literal::Bool(b) => {
                let _ = write!(out, "{b}");
            }
            Literal::Int(v) => {
                let _ = write!(out, "{v}");
            }
            Literal::Num(v) => {
                let _ = write!(out, "{v:?}");
            }
            Literal::Str(s) => {
                let _ = write!(out, "{s:?}");
            }
        },
        Node::Identifier { name, .. } => out.push_str(name),
        Node::Discard { .. } => out.push('_'),
        Node::Grouped { expr, .. } => {
            out.push('(');
            render_node(expr, out, level);
            out.push(')');
        }
        Node::Block { stmts, .. } => {
            if stmts.is_empty() {
                out.push_str("{ }");
                return;
            }
            out.push_str("{\n");
            for stmt in *stmts {
                indent(out, level + 1);
                render_node(stmt, out, level + 1);
                out.push_str(";\n");
            }
            indent(out, level);
            out.push('}');
        }
        Node::Decl {
            mutable,
            pattern,
            value,
            ..
        } => {
            out.push_str(if *mutable { "let " } else { "const " });
            render_node(pattern, out, level);
            out.push_str(" = ");
            render_node(value, out, level);
        }
        Node::Assign {
            target, op, value, ..
        } => {
            render_node(target, out, level);
            match op {
                Some(op) => {
                    let _ = write!(out, " {}= ", bin_op_text(*op));
                }
                None => out.push_str(" = "),
            }
            render_node(value, out, level);
        }
        Node::Infix { op, lhs, rhs, .. } => {
            render_node(lhs, out, level);
            if *op == BinOp::Range {
                out.push(':');
            } else {
                let _ = write!(out, " {} ", bin_op_text(*op));
            }
            render_node(rhs, out, level);
        }
        Node::TypeInfix { op, operand, ty, .. } => {
            render_node(operand, out, level);
            out.push_str(match op {
                TypeOp::As => " as ",
                TypeOp::Is => " is ",
            });
            out.push_str(ty);
        }
        Node::Prefix { op, operand, .. } => {
            out.push_str(match op {
                UnOp::Neg => "-",
                UnOp::BoolNot => "not ",
                UnOp::BitNot => "~",
            });
            render_node(operand, out, level);
        }
        Node::Try { expr, .. } => {
            out.push_str("try ");
            render_node(expr, out, level);
        }
        Node::Throw { expr, .. } => {
            out.push_str("throw ");
            render_node(expr, out, level);
        }
        Node::If {
            cond,
            then_body,
            else_body,
            ..
        } => {
            out.push_str("if (");
            render_node(cond, out, level);
            out.push_str(") ");
            render_node(then_body, out, level);
            if let Some(else_body) = else_body {
                out.push_str(" else ");
                render_node(else_body, out, level);
            }
        }
        Node::While { cond, body, .. } => {
            out.push_str("while (");
            render_node(cond, out, level);
            out.push_str(") ");
            render_node(body, out, level);
        }
        Node::For {
            pattern,
            iterable,
            body,
            ..
        } => {
            out.push_str("for ");
            render_node(pattern, out, level);
            out.push_str(" in ");
            render_node(iterable, out, level);
            out.push(' ');
            render_node(body, out, level);
        }
        Node::Match { subject, cases, .. } => {
            out.push_str("match (");
            render_node(subject, out, level);
            out.push_str(") {\n");
            for case in *cases {
                indent(out, level + 1);
                render_node(case.pattern, out, level + 1);
                out.push_str(" => ");
                render_node(case.body, out, level + 1);
                out.push_str(",\n");
            }
            indent(out, level);
            out.push('}');
        }
        Node::Tuple { items, .. } => {
            out.push('(');
            render_list(items, out, level);
            if items.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        Node::List { items, .. } => {
            out.push('[');
            render_list(items, out, level);
            out.push(']');
        }
        Node::Map { entries, .. } => {
            out.push('{');
            for (i, (key, value)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render_node(key, out, level);
                out.push_str(": ");
                render_node(value, out, level);
            }
            out.push('}');
        }
        Node::Fn { params, body, .. } => {
            out.push_str("fn(");
            render_list(params, out, level);
            out.push_str(") ");
            render_node(body, out, level);
        }
        Node::Suffix { op, operand, .. } => {
            render_node(operand, out, level);
            match op {
                SuffixOp::Call(args) => {
                    out.push('(');
                    render_list(args, out, level);
                    out.push(')');
                }
                SuffixOp::Index(index) => {
                    out.push('[');
                    render_node(index, out, level);
                    out.push(']');
                }
                SuffixOp::Member(name) => {
                    out.push('.');
                    out.push_str(name);
                }
            }
        }
        Node::ErrorValue { value, .. } => {
            out.push_str("error(");
            if let Some(value) = value {
                render_node(value, out, level);
            }
            out.push(')');
        }
        Node::Tagged { name, value, .. } => {
            let _ = write!(out, "@{name}");
            if let Some(value) = value {
                out.push('(');
                render_node(value, out, level);
                out.push(')');
            }
        }
        Node::Jump { kind, .. } => match kind {
            JumpKind::Break => out.push_str("break"),
            JumpKind::Continue => out.push_str("continue"),
            JumpKind::Return(value) => {
                out.push_str("return");
                if let Some(value) = value {
                    out.push(' ');
                    render_node(value, out, level);
                }
            }
        },
        Node::Catch {
            expr,
            binding,
            handler,
            ..
        } => {
            render_node(expr, out, level);
            out.push_str(" catch ");
            if let Some(binding) = binding {
                out.push('|');
                render_node(binding, out, level);
                out.push_str("| ");
            }
            render_node(handler, out, level);
        }
        Node::Import { path, .. } => {
            let _ = write!(out, "import({path:?})");
        }
        Node::Native { name, .. } => {
            let _ = write!(out, "native({name:?})");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::parser::parse;
    use bumpalo::Bump;

    fn roundtrip(src: &str) -> String {
        let arena = Bump::new();
        render(parse(&arena, src).unwrap())
    }

    #[test]
    fn normalizes_spacing() {
        assert_eq!(roundtrip("let x=1+2*3;x"), "let x = 1 + 2 * 3;\nx;\n");
    }

    #[test]
    fn rendered_output_reparses() {
        let src = "let f = fn(a, b) a + b; f(40, 2); for x in 1:4 { x; }; match (1) { 1 => true, _ => false }";
        let once = roundtrip(src);
        assert_eq!(roundtrip(&once), once);
    }

    #[test]
    fn keeps_catch_bindings_and_tags() {
        assert_eq!(
            roundtrip("try 1/0 catch |e| @fail(e)"),
            "try 1 / 0 catch |e| @fail(e);\n"
        );
    }
}
