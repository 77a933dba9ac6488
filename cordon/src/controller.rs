// SPDX-License-Identifier: AGPL-3.0-only

//! Holds the set of live commands keyed by opaque id.

use {
    crate::{
        cgroup::CgroupRoot,
        config::Config,
        error::Error,
        launcher::{AggregateError, Command},
    },
    std::{
        collections::HashMap,
        ffi::CString,
        sync::{Arc, RwLock},
    },
    tracing::info,
};

/// A snapshot of one command's status, suitable for listing.
pub struct CommandStatus
{
    /// The command's opaque id.
    pub command_id: String,
    /// The program that was started.
    pub program: String,
    /// Whether the command is still running.
    pub running: bool,
}

/// Owns every live [`Command`], keyed by `command_id`.
pub struct Controller
{
    config: Arc<Config>,
    cgroup_root: Arc<CgroupRoot>,
    commands: RwLock<HashMap<String, Arc<Command>>>,
}

impl Controller
{
    /// Build a controller against an already-set-up cgroup root.
    pub fn new(config: Arc<Config>, cgroup_root: Arc<CgroupRoot>) -> Self
    {
        Self{config, cgroup_root, commands: RwLock::new(HashMap::new())}
    }

    /// Construct, start, and register a command. On any failure nothing
    /// is registered.
    pub fn start_command(&self, argv: Vec<CString>) -> Result<Arc<Command>, Error>
    {
        let command = Arc::new(Command::new(
            Arc::clone(&self.config),
            Arc::clone(&self.cgroup_root),
            argv,
        )?);

        command.start()?;

        self.commands.write().unwrap().insert(command.command_id().to_owned(), Arc::clone(&command));
        info!(command_id = command.command_id(), "command registered");

        Ok(command)
    }

    /// Snapshot lookup by id.
    pub fn find_command(&self, command_id: &str) -> Option<Arc<Command>>
    {
        self.commands.read().unwrap().get(command_id).cloned()
    }

    /// Snapshot of every currently registered command.
    pub fn commands(&self) -> Vec<CommandStatus>
    {
        self.commands.read().unwrap().values()
            .map(|command| CommandStatus{
                command_id: command.command_id().to_owned(),
                program: command.program_display(),
                running: command.running(),
            })
            .collect()
    }

    /// Remove and close a command.
    pub fn finish_command(&self, command_id: &str) -> Result<(), AggregateError>
    {
        let command = self.commands.write().unwrap().remove(command_id);
        match command {
            Some(command) => command.close(),
            None => Ok(()),
        }
    }

    /// Snapshot the key set, then finish each entry; aggregate errors.
    pub fn close(&self) -> Result<(), AggregateError>
    {
        let ids: Vec<String> = self.commands.read().unwrap().keys().cloned().collect();

        let mut errors = Vec::new();
        for id in ids {
            if let Err(AggregateError(mut sub_errors)) = self.finish_command(&id) {
                errors.append(&mut sub_errors);
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(AggregateError(errors)) }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn unstarted_controller() -> Controller
    {
        let config = Arc::new(Config::from_env());
        let cgroup_root = Arc::new(CgroupRoot::for_tests(std::path::PathBuf::from("/nonexistent")));
        Controller::new(config, cgroup_root)
    }

    #[test]
    fn commands_on_a_fresh_controller_is_empty()
    {
        let controller = unstarted_controller();
        assert!(controller.commands().is_empty());
    }

    #[test]
    fn find_command_on_a_fresh_controller_finds_nothing()
    {
        let controller = unstarted_controller();
        assert!(controller.find_command("does-not-exist").is_none());
    }

    #[test]
    fn finish_command_on_an_unknown_id_is_a_no_op()
    {
        let controller = unstarted_controller();
        assert!(controller.finish_command("does-not-exist").is_ok());
    }

    #[test]
    fn close_on_a_fresh_controller_is_a_no_op()
    {
        let controller = unstarted_controller();
        assert!(controller.close().is_ok());
    }
}
