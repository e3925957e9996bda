use crate::actors::ShellHandle;

#[derive(Clone)]
pub struct AppState {
    shell: ShellHandle,
}

impl AppState {
    pub fn new(shell: ShellHandle) -> Self {
        Self { shell }
    }

    pub fn shell(&self) -> &ShellHandle {
        &self.shell
    }
}
