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

/*! The error taxonomy surfaced by the engine.

Every asynchronous handler receives a [`Result`] that either carries the
operation's value or one of these failures; synchronous calls use the
same taxonomy. The engine never silently drops a handler: each
`async_*` call results in exactly one handler invocation (multi-response
operations invoke until FINISHED or the caller stops them).
*/

/// A failure surfaced by the engine.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("the operation was canceled")]
    Canceled,

    #[error("the operation timed out")]
    Timeout,

    #[error("the payload exceeds the maximum message size")]
    BufferTooSmall,

    #[error("the terminal is not bound to any remote terminal")]
    NotBound,

    #[error("a handler is already awaiting this event")]
    AlreadyAwaiting,

    #[error("no message has been cached yet")]
    NoCache,

    #[error("invalid path '{0}'")]
    InvalidPath(String),

    #[error("invalid target '{0}'")]
    InvalidTarget(String),

    #[error("cannot parse configuration: {0}")]
    BadConfiguration(String),

    #[error("bad command line: {0}")]
    BadCommandLine(String),

    #[error("could not find any configuration files matching '{0}'")]
    BadConfigurationFilePattern(String),

    #[error("configuration child '{0}' not found")]
    BadConfigurationPath(String),

    #[error("configuration child has no data or the data cannot be converted to the requested type")]
    BadConfigurationDataAccess,

    #[error("the connection was lost")]
    ConnectionLost,

    #[error("the connection could not be assigned to the endpoint: {0}")]
    AssignmentFailed(String),

    /// The variant of the addressed terminal does not support the
    /// requested capability (e.g. publishing on a Deaf-Mute terminal).
    #[error("the terminal kind does not support this operation")]
    WrongTerminalKind,

    #[error("already started")]
    AlreadyStarted,

    #[error("unknown internal error")]
    Unknown,
}

pub type Result<T> = std::result::Result<T, Error>;
