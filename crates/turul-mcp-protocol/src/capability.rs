//! Which capability a method depends on, and which side has to declare it.
//!
//! A capability describes what the declaring side will *serve*. A server
//! declaring `tools` accepts `tools/call`; a client declaring `sampling`
//! accepts `sampling/createMessage`. List-changed and update notifications are
//! emitted by the side that declared them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::initialize::{ClientCapabilities, ServerCapabilities};
use crate::methods::{self, notifications};

/// Which end of a connection a peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn peer(&self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// A gate in the capability requirement table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Tools,
    ToolsListChanged,
    Resources,
    ResourcesSubscribe,
    ResourcesListChanged,
    Prompts,
    PromptsListChanged,
    Logging,
    Completions,
    Sampling,
    Roots,
    RootsListChanged,
    Elicitation,
}

impl Capability {
    pub const ALL: [Capability; 13] = [
        Capability::Tools,
        Capability::ToolsListChanged,
        Capability::Resources,
        Capability::ResourcesSubscribe,
        Capability::ResourcesListChanged,
        Capability::Prompts,
        Capability::PromptsListChanged,
        Capability::Logging,
        Capability::Completions,
        Capability::Sampling,
        Capability::Roots,
        Capability::RootsListChanged,
        Capability::Elicitation,
    ];

    /// The side whose declaration enables this capability
    pub fn declared_by(&self) -> Role {
        match self {
            Capability::Sampling
            | Capability::Roots
            | Capability::RootsListChanged
            | Capability::Elicitation => Role::Client,
            _ => Role::Server,
        }
    }

    /// Dotted path into the capability object, e.g. `resources.subscribe`
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Tools => "tools",
            Capability::ToolsListChanged => "tools.listChanged",
            Capability::Resources => "resources",
            Capability::ResourcesSubscribe => "resources.subscribe",
            Capability::ResourcesListChanged => "resources.listChanged",
            Capability::Prompts => "prompts",
            Capability::PromptsListChanged => "prompts.listChanged",
            Capability::Logging => "logging",
            Capability::Completions => "completions",
            Capability::Sampling => "sampling",
            Capability::Roots => "roots",
            Capability::RootsListChanged => "roots.listChanged",
            Capability::Elicitation => "elicitation",
        }
    }

    /// Look the capability up in the declaration of the side that owns it
    pub fn is_declared(&self, client: &ClientCapabilities, server: &ServerCapabilities) -> bool {
        match self {
            Capability::Tools => server.tools.is_some(),
            Capability::ToolsListChanged => server
                .tools
                .as_ref()
                .is_some_and(|t| t.list_changed == Some(true)),
            Capability::Resources => server.resources.is_some(),
            Capability::ResourcesSubscribe => server
                .resources
                .as_ref()
                .is_some_and(|r| r.subscribe == Some(true)),
            Capability::ResourcesListChanged => server
                .resources
                .as_ref()
                .is_some_and(|r| r.list_changed == Some(true)),
            Capability::Prompts => server.prompts.is_some(),
            Capability::PromptsListChanged => server
                .prompts
                .as_ref()
                .is_some_and(|p| p.list_changed == Some(true)),
            Capability::Logging => server.logging.is_some(),
            Capability::Completions => server.completions.is_some(),
            Capability::Sampling => client.sampling.is_some(),
            Capability::Roots => client.roots.is_some(),
            Capability::RootsListChanged => client
                .roots
                .as_ref()
                .is_some_and(|r| r.list_changed == Some(true)),
            Capability::Elicitation => client.elicitation.is_some(),
        }
    }
}

/// Requests the declaring side has to be able to answer once it declares
/// `capability`. Notification-only gates serve nothing.
pub fn served_methods(capability: Capability) -> &'static [&'static str] {
    match capability {
        Capability::Tools => &[methods::TOOLS_LIST, methods::TOOLS_CALL],
        Capability::Resources => &[methods::RESOURCES_LIST, methods::RESOURCES_READ],
        Capability::ResourcesSubscribe => {
            &[methods::RESOURCES_SUBSCRIBE, methods::RESOURCES_UNSUBSCRIBE]
        }
        Capability::Prompts => &[methods::PROMPTS_LIST, methods::PROMPTS_GET],
        Capability::Logging => &[methods::LOGGING_SET_LEVEL],
        Capability::Completions => &[methods::COMPLETION_COMPLETE],
        Capability::Sampling => &[methods::SAMPLING_CREATE_MESSAGE],
        Capability::Roots => &[methods::ROOTS_LIST],
        Capability::Elicitation => &[methods::ELICITATION_CREATE],
        Capability::ToolsListChanged
        | Capability::ResourcesListChanged
        | Capability::PromptsListChanged
        | Capability::RootsListChanged => &[],
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The capability a method needs, or `None` for ungated methods such as
/// `ping`, `initialize`, `notifications/cancelled` and `notifications/progress`
pub fn required_capability(method: &str) -> Option<Capability> {
    let capability = match method {
        methods::TOOLS_LIST | methods::TOOLS_CALL => Capability::Tools,
        methods::RESOURCES_LIST | methods::RESOURCES_READ | methods::RESOURCES_TEMPLATES_LIST => {
            Capability::Resources
        }
        methods::RESOURCES_SUBSCRIBE
        | methods::RESOURCES_UNSUBSCRIBE
        | notifications::RESOURCES_UPDATED => Capability::ResourcesSubscribe,
        methods::PROMPTS_LIST | methods::PROMPTS_GET => Capability::Prompts,
        methods::LOGGING_SET_LEVEL | notifications::MESSAGE => Capability::Logging,
        methods::COMPLETION_COMPLETE => Capability::Completions,
        notifications::TOOLS_LIST_CHANGED => Capability::ToolsListChanged,
        notifications::RESOURCES_LIST_CHANGED => Capability::ResourcesListChanged,
        notifications::PROMPTS_LIST_CHANGED => Capability::PromptsListChanged,
        methods::SAMPLING_CREATE_MESSAGE => Capability::Sampling,
        methods::ROOTS_LIST => Capability::Roots,
        methods::ELICITATION_CREATE => Capability::Elicitation,
        notifications::ROOTS_LIST_CHANGED => Capability::RootsListChanged,
        _ => return None,
    };
    Some(capability)
}
