//! Label trees parsed from prompt text.
//!
//! `[a, b]` detects `a` and `b` inside the enclosing label, `(a, b)` classifies
//! the enclosing label as one of `a` or `b`. Groups nest, so
//! `[a face [an eye, a nose], a hand]` detects eyes and noses inside faces.
//! Label `0` is the whole image.

use thiserror::Error;

pub const ROOT_LABEL: usize = 0;
const DEFAULT_ROOT_NAME: &str = "image";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeParseError {
    #[error("Unexpected '{found}' at position {position}")]
    UnexpectedCloser { found: char, position: usize },
    #[error("'{found}' at position {position} does not close the open group, expected '{expected}'")]
    MismatchedCloser {
        found: char,
        expected: char,
        position: usize,
    },
    #[error("',' at position {0} is outside of any group")]
    SeparatorOutsideGroup(usize),
    #[error("Missing '{0}' at end of prompt")]
    Unclosed(char),
    #[error("Label {0} is empty")]
    EmptyLabel(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOp {
    Detect,
    Classify,
}

impl TreeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            TreeOp::Detect => "detect",
            TreeOp::Classify => "classify",
        }
    }

    fn opener(&self) -> char {
        match self {
            TreeOp::Detect => '[',
            TreeOp::Classify => '(',
        }
    }

    fn closer(&self) -> char {
        match self {
            TreeOp::Detect => ']',
            TreeOp::Classify => ')',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub op: TreeOp,
    /// Label whose region this node operates on.
    pub input: usize,
    pub outputs: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
    pub labels: Vec<String>,
}

impl Tree {
    pub fn from_prompt(prompt: &str) -> Result<Self, TreeParseError> {
        let mut nodes: Vec<TreeNode> = Vec::new();
        let mut labels = vec![String::new()];
        // Innermost open node last; `label_stack` always has one more entry.
        let mut open_nodes: Vec<usize> = Vec::new();
        let mut label_stack: Vec<usize> = vec![ROOT_LABEL];

        for (position, ch) in prompt.chars().enumerate() {
            match ch {
                '[' | '(' => {
                    let op = if ch == '[' {
                        TreeOp::Detect
                    } else {
                        TreeOp::Classify
                    };
                    let label = labels.len();
                    labels.push(String::new());
                    nodes.push(TreeNode {
                        op,
                        input: current_label(&label_stack),
                        outputs: vec![label],
                    });
                    open_nodes.push(nodes.len() - 1);
                    label_stack.push(label);
                }
                ']' | ')' => {
                    let node_index = open_nodes
                        .pop()
                        .ok_or(TreeParseError::UnexpectedCloser { found: ch, position })?;
                    let expected = nodes[node_index].op.closer();
                    if expected != ch {
                        return Err(TreeParseError::MismatchedCloser {
                            found: ch,
                            expected,
                            position,
                        });
                    }
                    label_stack.pop();
                }
                ',' => {
                    let node_index = *open_nodes
                        .last()
                        .ok_or(TreeParseError::SeparatorOutsideGroup(position))?;
                    label_stack.pop();
                    let label = labels.len();
                    labels.push(String::new());
                    nodes[node_index].outputs.push(label);
                    label_stack.push(label);
                }
                _ => labels[current_label(&label_stack)].push(ch),
            }
        }

        if let Some(&node_index) = open_nodes.last() {
            return Err(TreeParseError::Unclosed(nodes[node_index].op.closer()));
        }

        let mut labels: Vec<String> = labels.iter().map(|l| l.trim().to_string()).collect();
        if labels[ROOT_LABEL].is_empty() {
            labels[ROOT_LABEL] = DEFAULT_ROOT_NAME.to_string();
        }
        if let Some(index) = labels.iter().position(|l| l.is_empty()) {
            return Err(TreeParseError::EmptyLabel(index));
        }

        Ok(Self { nodes, labels })
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    /// Nodes operating on `label`, in prompt order.
    pub fn children_of(&self, label: usize) -> impl Iterator<Item = &TreeNode> {
        self.nodes.iter().filter(move |node| node.input == label)
    }

    /// Nesting depth of each label; the root is at depth 0.
    pub fn label_depths(&self) -> Vec<usize> {
        let mut depths = vec![0; self.labels.len()];
        // Parents are always pushed before their children.
        for node in &self.nodes {
            let depth = depths[node.input] + 1;
            for &output in &node.outputs {
                depths[output] = depth;
            }
        }
        depths
    }

    /// Canonical prompt text for this tree.
    pub fn to_prompt(&self) -> String {
        let mut prompt = String::new();
        if self.labels[ROOT_LABEL] != DEFAULT_ROOT_NAME {
            prompt.push_str(&self.labels[ROOT_LABEL]);
        }
        self.write_children(ROOT_LABEL, &mut prompt);
        prompt.trim().to_string()
    }

    fn write_children(&self, label: usize, out: &mut String) {
        for node in self.children_of(label) {
            if !out.is_empty() && !out.ends_with(|c| c == '[' || c == '(') {
                out.push(' ');
            }
            out.push(node.op.opener());
            for (i, &output) in node.outputs.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&self.labels[output]);
                self.write_children(output, out);
            }
            out.push(node.op.closer());
        }
    }
}

fn current_label(label_stack: &[usize]) -> usize {
    label_stack.last().copied().unwrap_or(ROOT_LABEL)
}
