pub mod shell;

pub use shell::{
    spawn_shell, ShellActor, ShellExit, ShellHandle, ShellInfo, ShellMsg, ShellSpec,
};
