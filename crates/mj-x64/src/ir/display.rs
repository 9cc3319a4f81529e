use std::fmt;

use super::graph::{Graph, Mode, NodeKind, ProjKind, Relation};

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int32 => "i32",
            Self::Int64 => "i64",
            Self::Bool => "b",
            Self::Mem => "M",
            Self::Tuple => "T",
            Self::Control => "X",
        };
        write!(f, "{name}")
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Less => "lt",
            Self::LessEq => "le",
            Self::Greater => "gt",
            Self::GreaterEq => "ge",
        };
        write!(f, "{name}")
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph {} {{", self.name())?;
        for id in self.ids() {
            let node = self.node(id);
            write!(f, "  n{}: {}:{}", id.0, node.kind.name(), node.mode)?;
            match &node.kind {
                NodeKind::Const(v) => write!(f, " {v}")?,
                NodeKind::Address(sym) | NodeKind::Call(sym) => write!(f, " {sym}")?,
                NodeKind::Cmp(rel) => write!(f, " {rel}")?,
                NodeKind::Proj(kind) => {
                    let sel = match kind {
                        ProjKind::ArgTuple => "args".to_owned(),
                        ProjKind::Arg(i) => format!("arg{i}"),
                        ProjKind::Mem => "mem".to_owned(),
                        ProjKind::Res => "res".to_owned(),
                        ProjKind::True => "true".to_owned(),
                        ProjKind::False => "false".to_owned(),
                    };
                    write!(f, " {sel}")?;
                }
                _ => {}
            }
            if !node.preds.is_empty() {
                write!(f, " (")?;
                for (i, pred) in node.preds.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "n{}", pred.0)?;
                }
                write!(f, ")")?;
            }
            if !matches!(node.kind, NodeKind::Block) {
                write!(f, " @n{}", node.block.0)?;
            }
            writeln!(f)?;
        }
        write!(f, "}}")
    }
}
