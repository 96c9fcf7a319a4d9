use edgelink_object::{Kv, Result, Value};

use crate::connection::Connection;

const UPDATE_STATE: &str = "aws.greengrass#UpdateState";
const UPDATE_STATE_MODEL: &str = "aws.greengrass#UpdateStateRequest";
const RESTART_COMPONENT: &str = "aws.greengrass#RestartComponent";
const RESTART_COMPONENT_MODEL: &str = "aws.greengrass#RestartComponentRequest";

/// Lifecycle states a component can report to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Running,
    Errored,
}

impl ComponentState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Errored => "ERRORED",
        }
    }
}

impl Connection {
    /// Reports this component's lifecycle state to the runtime.
    pub fn update_state(&self, state: ComponentState) -> Result<()> {
        let params = [Kv::new(b"state", Value::Buf(state.as_str().as_bytes()))];
        self.call_no_reply(UPDATE_STATE, UPDATE_STATE_MODEL, &params, None)
    }

    /// Asks the runtime to restart `component_name`.
    pub fn restart_component(&self, component_name: &str) -> Result<()> {
        let params = [Kv::new(b"componentName", Value::Buf(component_name.as_bytes()))];
        self.call_no_reply(RESTART_COMPONENT, RESTART_COMPONENT_MODEL, &params, None)
    }
}
