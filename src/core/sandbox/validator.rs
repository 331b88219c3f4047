//! Static checks run before any sandboxed code executes.
//!
//! This is a deny-list over the syntax tree, not an enforcement boundary:
//! the restricted namespace and import hook in the interpreter are what
//! actually limit a running snippet.

use super::ast::*;

pub const PROHIBITED_FUNCTIONS: &[&str] = &[
    "exec", "eval", "compile", "open", "__import__", "getattr", "setattr", "delattr", "hasattr", "globals",
    "locals", "vars", "dir",
];

pub const PROHIBITED_MODULES: &[&str] = &[
    "os", "sys", "subprocess", "socket", "urllib", "requests", "shutil", "pathlib", "tempfile",
];

/// Every violation in `program`, in source order.
pub fn violations(program: &Program) -> Vec<String> {
    let mut walker = Walker::default();
    walker.block(program);
    walker.found
}

fn root_module(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

#[derive(Default)]
struct Walker {
    found: Vec<String>,
}

impl Walker {
    fn block(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Expr(expr) => self.expr(expr),
            StmtKind::Assign { targets, value } => {
                targets.iter().for_each(|t| self.expr(t));
                self.expr(value);
            }
            StmtKind::AugAssign { target, value, .. } => {
                self.expr(target);
                self.expr(value);
            }
            StmtKind::If { test, body, orelse } | StmtKind::While { test, body, orelse } => {
                self.expr(test);
                self.block(body);
                self.block(orelse);
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                self.expr(target);
                self.expr(iter);
                self.block(body);
                self.block(orelse);
            }
            StmtKind::FunctionDef { params, body, .. } => {
                self.params(params);
                self.block(body);
            }
            StmtKind::Return(value) | StmtKind::Raise(value) => {
                if let Some(value) = value {
                    self.expr(value);
                }
            }
            StmtKind::Import(names) => {
                for alias in names {
                    let root = root_module(&alias.name);
                    if PROHIBITED_MODULES.contains(&root) {
                        self.found.push(format!("Prohibited import: {}", root));
                    }
                }
            }
            StmtKind::ImportFrom { module, .. } => {
                let root = root_module(module);
                if PROHIBITED_MODULES.contains(&root) {
                    self.found.push(format!("Prohibited import from: {}", root));
                }
            }
            StmtKind::Delete(targets) => targets.iter().for_each(|t| self.expr(t)),
            StmtKind::Assert { test, message } => {
                self.expr(test);
                if let Some(message) = message {
                    self.expr(message);
                }
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                self.block(body);
                for handler in handlers {
                    if let Some(kind) = &handler.kind {
                        self.expr(kind);
                    }
                    self.block(&handler.body);
                }
                self.block(orelse);
                self.block(finalbody);
            }
            StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Pass
            | StmtKind::Global(_)
            | StmtKind::Nonlocal(_) => {}
        }
    }

    fn params(&mut self, params: &Params) {
        for default in params.defaults() {
            self.expr(default);
        }
    }

    fn comprehensions(&mut self, generators: &[Comprehension]) {
        for generator in generators {
            self.expr(&generator.target);
            self.expr(&generator.iter);
            generator.conditions.iter().for_each(|c| self.expr(c));
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Constant(_) | Expr::Name(_) => {}
            Expr::FString(parts) => {
                for part in parts {
                    if let FStringPart::Field { expr, .. } = part {
                        self.expr(expr);
                    }
                }
            }
            Expr::List(items) | Expr::Tuple(items) | Expr::Set(items) => items.iter().for_each(|i| self.expr(i)),
            Expr::Dict(pairs) => {
                for (key, value) in pairs {
                    self.expr(key);
                    self.expr(value);
                }
            }
            Expr::Attribute { value, attr } => {
                if attr.starts_with('_') {
                    self.found.push(format!("Prohibited attribute access: {}", attr));
                }
                self.expr(value);
            }
            Expr::Subscript { value, index } => {
                self.expr(value);
                self.expr(index);
            }
            Expr::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.expr(part);
                }
            }
            Expr::Call { func, args } => {
                if let Expr::Name(name) = func.as_ref() {
                    if PROHIBITED_FUNCTIONS.contains(&name.as_str()) {
                        self.found.push(format!("Prohibited function: {}", name));
                    }
                }
                self.expr(func);
                for arg in args {
                    match arg {
                        CallArg::Positional(value)
                        | CallArg::Keyword(_, value)
                        | CallArg::Star(value)
                        | CallArg::DoubleStar(value) => self.expr(value),
                    }
                }
            }
            Expr::BinOp { left, right, .. } | Expr::BoolOp { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
            Expr::UnaryOp { operand, .. } => self.expr(operand),
            Expr::Compare { left, comparisons } => {
                self.expr(left);
                comparisons.iter().for_each(|(_, right)| self.expr(right));
            }
            Expr::IfExp { test, body, orelse } => {
                self.expr(test);
                self.expr(body);
                self.expr(orelse);
            }
            Expr::ListComp { element, generators } | Expr::SetComp { element, generators } => {
                self.comprehensions(generators);
                self.expr(element);
            }
            Expr::DictComp { key, value, generators } => {
                self.comprehensions(generators);
                self.expr(key);
                self.expr(value);
            }
            Expr::Lambda { params, body } => {
                self.params(params);
                self.expr(body);
            }
            Expr::Starred(inner) => self.expr(inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sandbox::parser::parse;

    fn check(source: &str) -> Vec<String> {
        violations(&parse(source).unwrap())
    }

    #[test]
    fn test_clean_code_passes() {
        assert!(check("import math\nx = [math.sqrt(i) for i in range(4)]\n").is_empty());
    }

    #[test]
    fn test_imports_are_rejected() {
        assert_eq!(check("import os"), vec!["Prohibited import: os"]);
        assert_eq!(check("import os.path as p"), vec!["Prohibited import: os"]);
        assert_eq!(check("from subprocess import run"), vec!["Prohibited import from: subprocess"]);
        assert_eq!(check("from os.path import join"), vec!["Prohibited import from: os"]);
        assert!(check("import osmosis").is_empty());
    }

    #[test]
    fn test_calls_and_attributes_are_rejected_everywhere() {
        let found = check(
            "def f(x=eval('1')):\n    return x.__class__\n\nprint(f\"{open('f')}\")\ny = [dir(i) for i in range(2)]\n",
        );
        assert_eq!(
            found,
            vec![
                "Prohibited function: eval",
                "Prohibited attribute access: __class__",
                "Prohibited function: open",
                "Prohibited function: dir",
            ]
        );
    }

    #[test]
    fn test_shadowed_names_are_still_rejected() {
        assert_eq!(check("exec = print\nexec('x')"), vec!["Prohibited function: exec"]);
    }
}
