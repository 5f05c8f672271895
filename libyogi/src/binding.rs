// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/*! Explicit bindings on primitive terminals.

A binding declares interest in remote terminals matching a target name:
its state becomes ESTABLISHED while at least one terminal with the
source's variant and signature is known under the resolved target name,
and messages from such terminals are delivered to the source terminal.

Only the four primitive variants accept explicit bindings; the
convenience variants come with a fixed builtin binding instead.
*/

use std::sync::Arc;

use yogi_protocol::BindingState;

use crate::{
    endpoint::EndpointInner,
    errors::{Error, Result},
    terminal::Terminal,
};

pub struct Binding {
    endpoint: Arc<EndpointInner>,
    id: u32,
    targets: String,
}

impl Binding {
    /// Bind `terminal` to remote terminals matching `targets`. The
    /// target path is resolved against the endpoint's configured
    /// location when relative. Fails with *wrong-terminal-kind* on a
    /// non-primitive terminal.
    pub fn new(terminal: &Terminal, targets: &str) -> Result<Binding> {
        let endpoint = Arc::clone(terminal.inner());
        let (id, _) = endpoint.create_binding(terminal.id(), targets)?;
        Ok(Binding { endpoint, id, targets: String::from(targets) })
    }

    /// The target pattern as given at creation.
    pub fn targets(&self) -> &str {
        &self.targets
    }

    pub fn get_binding_state(&self) -> Result<BindingState> {
        self.endpoint.binding_state(self.id)
    }

    pub fn async_get_binding_state<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(Result<BindingState>) + Send + 'static,
    {
        let state = self.endpoint.binding_state(self.id);
        let strand = self.endpoint.binding_strand(self.id).ok_or(Error::Unknown)?;
        strand.post(move || handler(state));
        Ok(())
    }

    /// One-shot: fires on the next RELEASED/ESTABLISHED transition.
    pub fn async_await_binding_state_change<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(Result<BindingState>) + Send + 'static,
    {
        self.endpoint.async_await_binding_change(self.id, Box::new(handler))
    }

    /// The outstanding wait, if any, completes with *canceled*.
    pub fn cancel_await_binding_state_change(&self) {
        self.endpoint.cancel_await_binding_change(self.id);
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.endpoint.destroy_binding(self.id);
    }
}
