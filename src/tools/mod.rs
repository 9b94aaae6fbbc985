//! Built-in tools available to the CLI.

mod command;
mod echo;

pub use command::CommandTool;
pub use echo::EchoTool;

use crate::orchestration::ToolRegistry;

/// Registry with every built-in tool.
pub fn builtin_registry() -> ToolRegistry {
    ToolRegistry::builder()
        .register(EchoTool)
        .register(CommandTool)
        .build()
}
