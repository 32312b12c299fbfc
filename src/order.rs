//! Scripted answers for batch-mode prompts
//!
//! Multi-step operations such as key generation or key editing make gpg ask a
//! series of questions on the command channel. A [`TaskOrder`] holds the
//! prepared answers in the order they are expected and hands them out as the
//! prompts arrive.
//!
//! # Example
//!
//! ```
//! use gpg_task::order::TaskOrder;
//! use gpg_task::status::StatusKeyword;
//!
//! let mut order = TaskOrder::new();
//! order.add_cmd("uid 1", "keyedit.prompt");
//! order.add_optional_cmd("y", "keyedit.remove.uid.okay");
//! order.add_cmd("save", "keyedit.prompt");
//!
//! assert_eq!(
//!     order.cmd_for_prompt("keyedit.prompt", StatusKeyword::GetLine).as_deref(),
//!     Some("uid 1")
//! );
//! // gpg skipped the confirmation this time; the optional item is passed over
//! assert_eq!(
//!     order.cmd_for_prompt("keyedit.prompt", StatusKeyword::GetLine).as_deref(),
//!     Some("save")
//! );
//! ```

use crate::status::StatusKeyword;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Answer policy for yes/no prompts nobody scripted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoolAnswer {
    /// Unscripted questions stay unanswered (default)
    #[default]
    NoDefault,
    /// Answer `y`
    YesToAll,
    /// Answer `n`
    NoToAll,
}

/// The text sent for a matched prompt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderCommand {
    /// A literal command or value
    Text(String),
    /// A number, sent in decimal
    Int(i64),
}

impl fmt::Display for OrderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderCommand::Text(text) => f.write_str(text),
            OrderCommand::Int(n) => write!(f, "{n}"),
        }
    }
}

/// One scripted answer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOrderItem {
    /// What to send
    pub command: OrderCommand,
    /// The prompt identifier it answers (e.g. `keygen.name`)
    pub prompt: String,
    /// Whether gpg may not ask this question at all
    pub optional: bool,
}

/// Ordered prompt/answer script consumed by a single task
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskOrder {
    items: Vec<TaskOrderItem>,
    #[serde(default)]
    default_bool_answer: BoolAnswer,
    #[serde(skip)]
    cursor: usize,
}

impl TaskOrder {
    /// Empty order without a default answer
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty order answering every unscripted yes/no question with `y`
    pub fn yes_to_all() -> Self {
        Self {
            default_bool_answer: BoolAnswer::YesToAll,
            ..Self::default()
        }
    }

    /// Empty order answering every unscripted yes/no question with `n`
    pub fn no_to_all() -> Self {
        Self {
            default_bool_answer: BoolAnswer::NoToAll,
            ..Self::default()
        }
    }

    /// Current default answer policy
    pub fn default_bool_answer(&self) -> BoolAnswer {
        self.default_bool_answer
    }

    /// Change the default answer policy
    pub fn set_default_bool_answer(&mut self, answer: BoolAnswer) {
        self.default_bool_answer = answer;
    }

    /// Append an item
    pub fn add(&mut self, command: OrderCommand, prompt: impl Into<String>, optional: bool) {
        self.items.push(TaskOrderItem {
            command,
            prompt: prompt.into(),
            optional,
        });
    }

    /// Append a mandatory text answer
    pub fn add_cmd(&mut self, cmd: impl Into<String>, prompt: impl Into<String>) {
        self.add(OrderCommand::Text(cmd.into()), prompt, false);
    }

    /// Append a mandatory numeric answer
    pub fn add_int(&mut self, cmd: i64, prompt: impl Into<String>) {
        self.add(OrderCommand::Int(cmd), prompt, false);
    }

    /// Append an optional text answer
    pub fn add_optional_cmd(&mut self, cmd: impl Into<String>, prompt: impl Into<String>) {
        self.add(OrderCommand::Text(cmd.into()), prompt, true);
    }

    /// Append an optional numeric answer
    pub fn add_optional_int(&mut self, cmd: i64, prompt: impl Into<String>) {
        self.add(OrderCommand::Int(cmd), prompt, true);
    }

    /// All items, consumed or not
    pub fn items(&self) -> &[TaskOrderItem] {
        &self.items
    }

    /// Items not yet consumed
    pub fn remaining(&self) -> &[TaskOrderItem] {
        &self.items[self.cursor..]
    }

    /// Find the answer for a prompt
    ///
    /// Scans forward from the cursor, passing over optional items whose prompt
    /// does not match. A match consumes the item (and the optional items passed
    /// over to reach it). If a mandatory item does not match, or the script is
    /// exhausted, nothing is consumed and `GET_BOOL` prompts fall back to the
    /// default answer policy.
    pub fn cmd_for_prompt(&mut self, prompt: &str, keyword: StatusKeyword) -> Option<String> {
        for (offset, item) in self.items[self.cursor..].iter().enumerate() {
            if item.prompt == prompt {
                let command = item.command.to_string();
                self.cursor += offset + 1;
                debug!(prompt, index = self.cursor - 1, "task order matched prompt");
                return Some(command);
            }
            if !item.optional {
                break;
            }
        }

        if keyword == StatusKeyword::GetBool {
            match self.default_bool_answer {
                BoolAnswer::YesToAll => return Some("y".to_string()),
                BoolAnswer::NoToAll => return Some("n".to_string()),
                BoolAnswer::NoDefault => {}
            }
        }

        debug!(prompt, %keyword, "task order has no answer");
        None
    }
}
