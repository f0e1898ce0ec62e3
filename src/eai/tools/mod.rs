//! Built-in tool set.
//!
//! The engine ships a fixed catalog: shell execution, file read/write/
//! append/edit/patch, directory listing, recursive text search, and
//! filename globbing. [`full_toolset`] builds the complete registry;
//! [`read_only_toolset`] is the same registry minus every mutating tool,
//! with shell execution constrained to the inspection allow/deny policy.
//! The read-only variant is a strict sub-policy, not a separate code path.

pub mod filesystem;
pub mod patch;
pub mod shell;

use crate::eai::tool_protocol::{Tool, ToolRegistry};
use std::path::Path;
use std::sync::Arc;

/// Tool names that mutate the host environment.
pub const MUTATING_TOOLS: &[&str] = &["write_file", "append_file", "edit_file", "patch_file"];

/// The complete built-in tool registry.
pub fn full_toolset(workdir: &Path) -> ToolRegistry {
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(shell::ShellTool::new(workdir)),
        Arc::new(filesystem::ReadFileTool::new(workdir)),
        Arc::new(filesystem::WriteFileTool::new(workdir)),
        Arc::new(filesystem::AppendFileTool::new(workdir)),
        Arc::new(filesystem::EditFileTool::new(workdir)),
        Arc::new(patch::PatchFileTool::new(workdir)),
        Arc::new(filesystem::ListDirectoryTool::new(workdir)),
        Arc::new(filesystem::SearchTextTool::new(workdir)),
        Arc::new(filesystem::FindFilesTool::new(workdir)),
    ];
    ToolRegistry::new(tools)
}

/// The read-only discovery registry: mutating tools removed, shell
/// execution restricted to inspection commands.
pub fn read_only_toolset(workdir: &Path) -> ToolRegistry {
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(
            shell::ShellTool::new(workdir)
                .with_policy(shell::ShellPolicy::read_only())
                .without_auto_detach(),
        ),
        Arc::new(filesystem::ReadFileTool::new(workdir)),
        Arc::new(filesystem::ListDirectoryTool::new(workdir)),
        Arc::new(filesystem::SearchTextTool::new(workdir)),
        Arc::new(filesystem::FindFilesTool::new(workdir)),
    ];
    ToolRegistry::new(tools)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_set_has_every_documented_tool() {
        let registry = full_toolset(Path::new("/tmp"));
        for name in &[
            "shell_execute",
            "read_file",
            "write_file",
            "append_file",
            "edit_file",
            "patch_file",
            "list_directory",
            "search_text",
            "find_files",
        ] {
            assert!(registry.contains(name), "missing {}", name);
        }
    }

    #[test]
    fn read_only_set_has_no_mutating_tools() {
        let registry = read_only_toolset(Path::new("/tmp"));
        for name in MUTATING_TOOLS {
            assert!(!registry.contains(name), "{} should be absent", name);
        }
        assert!(registry.contains("shell_execute"));
        assert!(registry.contains("read_file"));
    }
}
