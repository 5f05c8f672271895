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

/*! Terminals: the named I/O points of the engine.

A [`Terminal`] is a single handle type covering all fourteen variants;
which methods it supports depends on the variant it was created with.
Calling a capability the variant lacks fails with *wrong-terminal-kind*
(the session surface maps that onto its InvalidTerminalType status).

A terminal is exclusively owned: dropping the handle destroys it, and
every outstanding asynchronous operation completes with *canceled*
before the destruction returns.
*/

use std::sync::Arc;

use yogi_protocol::{BindingState, Signature, SubscriptionState, TerminalInfo, TerminalKind};

use crate::{
    endpoint::{Endpoint, EndpointInner},
    errors::{Error, Result},
};

/// A published message handed to a receive handler.
#[derive(Clone, Debug)]
pub struct Message {
    pub payload: Vec<u8>,
    /// True iff this is a cache replay delivered on binding
    /// establishment rather than a live publish.
    pub cached: bool,
}

/// One response within a scatter-gather or request operation.
#[derive(Clone, Debug)]
pub struct GatheredMessage {
    pub operation_id: u32,
    /// Bit field; see [`yogi_protocol::gather_flags`].
    pub flags: u8,
    pub payload: Vec<u8>,
}

/// What a gather handler tells the engine to do with the rest of the
/// operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlFlow {
    Continue,
    Stop,
}

/// A scattered message or request delivered to a responder. Must be
/// answered with exactly one of [`respond`](Self::respond) or
/// [`ignore`](Self::ignore); if the responder terminal is destroyed
/// first, the requester sees BINDING_DESTROYED.
pub struct ScatteredMessage {
    endpoint: Arc<EndpointInner>,
    terminal: u32,
    operation: u32,
    payload: Vec<u8>,
}

impl ScatteredMessage {
    pub(crate) fn new(
        endpoint: Arc<EndpointInner>,
        terminal: u32,
        operation: u32,
        payload: Vec<u8>,
    ) -> ScatteredMessage {
        ScatteredMessage { endpoint, terminal, operation, payload }
    }

    pub fn operation_id(&self) -> u32 {
        self.operation
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn respond(self, payload: &[u8]) -> Result<()> {
        self.endpoint.respond_scattered(self.terminal, self.operation, payload.to_vec(), false)
    }

    pub fn ignore(self) -> Result<()> {
        self.endpoint.respond_scattered(self.terminal, self.operation, vec![], true)
    }
}

/// Handle to an in-flight scatter-gather or request operation.
pub struct Operation {
    endpoint: Arc<EndpointInner>,
    id: u32,
}

impl Operation {
    pub fn operation_id(&self) -> u32 {
        self.id
    }

    /// Stop the operation; the handler fires once more with
    /// *canceled*. Canceling a completed operation does nothing.
    pub fn cancel(&self) {
        EndpointInner::cancel_operation(&self.endpoint, self.id, true);
    }
}

pub struct Terminal {
    endpoint: Arc<EndpointInner>,
    id: u32,
    info: TerminalInfo,
}

impl Terminal {
    /// Create a terminal on an endpoint. A relative name is resolved
    /// against the endpoint's configured location, if any.
    pub fn new<E>(
        endpoint: &E,
        kind: TerminalKind,
        name: &str,
        signature: Signature,
    ) -> Result<Terminal>
    where
        E: AsRef<Endpoint>,
    {
        let inner = Arc::clone(&endpoint.as_ref().inner);
        let (id, info) = inner.create_terminal(kind, name, signature)?;
        Ok(Terminal { endpoint: inner, id, info })
    }

    pub fn kind(&self) -> TerminalKind {
        self.info.kind
    }

    /// The absolute name after resolution, or the relative name as
    /// given when the endpoint has no location.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn signature(&self) -> Signature {
        self.info.signature
    }

    pub fn info(&self) -> &TerminalInfo {
        &self.info
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn inner(&self) -> &Arc<EndpointInner> {
        &self.endpoint
    }

    // ---------------------------------------------------------------
    // publish-like capability

    /// Send a payload to every bound counterpart. Fails with
    /// *not-bound* when nobody is subscribed; for cached variants the
    /// local cache is updated regardless.
    pub fn publish(&self, payload: &[u8]) -> Result<()> {
        self.endpoint.publish(self.id, payload)
    }

    /// Like [`publish`](Self::publish) but reports failure as `false`.
    pub fn try_publish(&self, payload: &[u8]) -> bool {
        self.endpoint.publish(self.id, payload).is_ok()
    }

    /// The locally cached payload; fails with *no-cache* when nothing
    /// has been published or received yet.
    pub fn get_cached_message(&self) -> Result<Vec<u8>> {
        self.endpoint.get_cached(self.id)
    }

    /// Deliver the next received message to `handler`. Only one
    /// receive may be outstanding per terminal; a second registration
    /// fails with *already-awaiting*.
    pub fn async_receive_message<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(Result<Message>) + Send + 'static,
    {
        self.endpoint.async_receive_message(self.id, Box::new(handler))
    }

    /// The outstanding receive, if any, completes with *canceled*.
    pub fn cancel_receive_message(&self) {
        self.endpoint.cancel_receive_message(self.id);
    }

    // ---------------------------------------------------------------
    // binder capability (builtin binding of the convenience variants)

    pub fn get_binding_state(&self) -> Result<BindingState> {
        self.endpoint.builtin_binding_state(self.id)
    }

    pub fn async_get_binding_state<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(Result<BindingState>) + Send + 'static,
    {
        let state = self.endpoint.builtin_binding_state(self.id);
        let strand = self.endpoint.terminal_strand(self.id).ok_or(Error::Unknown)?;
        strand.post(move || handler(state));
        Ok(())
    }

    pub fn async_await_binding_state_change<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(Result<BindingState>) + Send + 'static,
    {
        self.endpoint.async_await_builtin_binding_change(self.id, Box::new(handler))
    }

    pub fn cancel_await_binding_state_change(&self) {
        self.endpoint.cancel_await_builtin_binding_change(self.id);
    }

    // ---------------------------------------------------------------
    // subscribable capability

    pub fn get_subscription_state(&self) -> Result<SubscriptionState> {
        self.endpoint.subscription_state(self.id)
    }

    pub fn async_get_subscription_state<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(Result<SubscriptionState>) + Send + 'static,
    {
        let state = self.endpoint.subscription_state(self.id);
        let strand = self.endpoint.terminal_strand(self.id).ok_or(Error::Unknown)?;
        strand.post(move || handler(state));
        Ok(())
    }

    pub fn async_await_subscription_state_change<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(Result<SubscriptionState>) + Send + 'static,
    {
        self.endpoint.async_await_subscription_change(self.id, Box::new(handler))
    }

    pub fn cancel_await_subscription_state_change(&self) {
        self.endpoint.cancel_await_subscription_change(self.id);
    }

    // ---------------------------------------------------------------
    // scatter-gather / request capability

    /// Fan a payload out to every bound peer. The handler is invoked
    /// once per peer response and decides whether to continue; the
    /// final response carries the FINISHED flag. An empty fanout
    /// yields exactly one FINISHED|DEAF invocation.
    pub fn async_scatter_gather<F>(&self, payload: &[u8], handler: F) -> Result<Operation>
    where
        F: FnMut(Result<GatheredMessage>) -> ControlFlow + Send + 'static,
    {
        let id = self.endpoint.async_scatter(self.id, payload, Box::new(handler))?;
        Ok(Operation { endpoint: Arc::clone(&self.endpoint), id })
    }

    /// Client-side alias of
    /// [`async_scatter_gather`](Self::async_scatter_gather).
    pub fn async_request<F>(&self, payload: &[u8], handler: F) -> Result<Operation>
    where
        F: FnMut(Result<GatheredMessage>) -> ControlFlow + Send + 'static,
    {
        self.async_scatter_gather(payload, handler)
    }

    /// Deliver the next scattered message to `handler`. A scattered
    /// message arriving while no handler is registered is answered
    /// with IGNORED by the engine.
    pub fn async_receive_scattered_message<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(Result<ScatteredMessage>) + Send + 'static,
    {
        self.endpoint.async_receive_scattered(self.id, Box::new(handler))
    }

    /// Service-side alias of
    /// [`async_receive_scattered_message`](Self::async_receive_scattered_message).
    pub fn async_receive_request<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(Result<ScatteredMessage>) + Send + 'static,
    {
        self.async_receive_scattered_message(handler)
    }

    pub fn cancel_receive_scattered_message(&self) {
        self.endpoint.cancel_receive_scattered(self.id);
    }

    pub fn cancel_receive_request(&self) {
        self.cancel_receive_scattered_message();
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        self.endpoint.destroy_terminal(self.id);
    }
}
