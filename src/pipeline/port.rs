//! Port descriptors for the node system.
//!
//! Each node declares its ports through a static `PortSpec` array. The graph
//! uses the specs to validate edges when they are declared and to check
//! incoming messages before a node runs.
//!
//! ```ignore
//! const PORTS: &[PortSpec] = &[
//!     PortSpec::input("in").expects(MessageKind::Image).satisfying(Message::is_greyscale),
//!     PortSpec::output("out").expects(MessageKind::Keypoints),
//! ];
//! ```

use crate::pipeline::message::{Message, MessageKind};

/// Name of the default input port
pub const DEFAULT_INPUT: &str = "in";

/// Name of the default output port
pub const DEFAULT_OUTPUT: &str = "out";

/// Validity predicate for incoming messages
pub type MessagePredicate = fn(&Message) -> bool;

/// Whether a port is an input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// Static descriptor for a node's port.
#[derive(Debug, Clone, Copy)]
pub struct PortSpec {
    pub name: &'static str,
    pub direction: PortDirection,
    /// Must be set with [`PortSpec::expects`]
    pub kind: Option<MessageKind>,
    pub predicate: Option<MessagePredicate>,
}

impl PortSpec {
    pub const fn input(name: &'static str) -> Self {
        Self {
            name,
            direction: PortDirection::Input,
            kind: None,
            predicate: None,
        }
    }

    pub const fn output(name: &'static str) -> Self {
        Self {
            name,
            direction: PortDirection::Output,
            kind: None,
            predicate: None,
        }
    }

    pub const fn expects(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub const fn satisfying(mut self, predicate: MessagePredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn is_input(&self) -> bool {
        self.direction == PortDirection::Input
    }

    pub fn is_output(&self) -> bool {
        self.direction == PortDirection::Output
    }

    /// Check kind and predicate of a message.
    pub fn accepts(&self, message: &Message) -> Result<(), String> {
        match self.kind {
            Some(kind) if kind != message.kind() => {
                return Err(format!("expected {}, got {}", kind, message.kind()))
            }
            None => return Err("port kind was never declared".to_string()),
            Some(_) => {}
        }
        if let Some(predicate) = self.predicate {
            if !predicate(message) {
                return Err("message does not satisfy the port predicate".to_string());
            }
        }
        Ok(())
    }
}
