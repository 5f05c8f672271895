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

/*! JSON configuration.

A configuration is a single JSON object merged from an ordered list of
config files followed by command line overrides. A later source
overrides an earlier one key by key; an explicit `null` removes the
key. Durations are given in seconds as floats, with negative values
meaning infinite.
*/

use std::{fs, time};

use serde_json::Value;
use tracing::info;

use crate::{
    errors::{Error, Result},
    path::Path,
    Args,
};

#[derive(Clone, Debug)]
pub struct Configuration {
    root: Value,
}

impl Configuration {
    pub fn new() -> Configuration {
        Configuration { root: Value::Object(Default::default()) }
    }

    /// Build the configuration from parsed command line arguments:
    /// config files merged in order, then `--json` overrides, then the
    /// dedicated override flags.
    pub fn from_command_line(args: &Args) -> Result<Configuration> {
        let mut config = Configuration::new();

        for file in &args.config_files {
            info!("merging configuration file {}", file);
            let text = fs::read_to_string(file)
                .map_err(|_| Error::BadConfigurationFilePattern(file.clone()))?;
            let value: Value = serde_json::from_str(&text)
                .map_err(|e| Error::BadConfiguration(format!("{file}: {e}")))?;
            merge_values(&mut config.root, &value);
        }

        for json in &args.json_overrides {
            let value: Value =
                serde_json::from_str(json).map_err(|e| Error::BadCommandLine(e.to_string()))?;
            merge_values(&mut config.root, &value);
        }

        if let Some(target) = &args.connection_target {
            config.put("yogi.connection.target", Value::from(target.as_str()));
        }
        if let Some(identification) = &args.connection_identification {
            config.put("yogi.connection.identification", Value::from(identification.as_str()));
        }
        if let Some(timeout) = args.connection_timeout {
            config.put("yogi.connection.timeout", Value::from(timeout));
        }
        if let Some(location) = &args.location {
            config.put("yogi.location", Value::from(location.as_str()));
        }

        // catch a bad location early; everything downstream relies on it
        config.location()?;

        Ok(config)
    }

    /// Merge a partial JSON document into the configuration.
    pub fn update(&mut self, json: &str) -> Result<()> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| Error::BadConfiguration(e.to_string()))?;
        merge_values(&mut self.root, &value);
        Ok(())
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Look up a child by dotted path.
    pub fn child(&self, path: &str) -> Result<&Value> {
        let mut value = &self.root;
        for part in path.split('.') {
            value = value
                .as_object()
                .and_then(|o| o.get(part))
                .ok_or_else(|| Error::BadConfigurationPath(String::from(path)))?;
        }
        Ok(value)
    }

    pub fn get_string(&self, path: &str) -> Result<String> {
        self.child(path)?.as_str().map(String::from).ok_or(Error::BadConfigurationDataAccess)
    }

    pub fn get_optional_string(&self, path: &str) -> Option<String> {
        self.child(path).ok().and_then(|v| v.as_str()).map(String::from)
    }

    pub fn get_optional_f64(&self, path: &str) -> Option<f64> {
        self.child(path).ok().and_then(|v| v.as_f64())
    }

    /// The location prefix applied to relative terminal names of this
    /// process, `/` unless configured.
    pub fn location(&self) -> Result<Path> {
        match self.get_optional_string("yogi.location") {
            Some(s) => Path::new(s),
            None => Ok(Path::root()),
        }
    }

    pub fn connection_target(&self) -> Option<String> {
        self.get_optional_string("yogi.connection.target")
    }

    /// None means infinite.
    pub fn connection_timeout(&self) -> Option<time::Duration> {
        let secs = self.get_optional_f64("yogi.connection.timeout").unwrap_or(-1.0);
        if secs < 0.0 {
            None
        } else {
            Some(time::Duration::from_millis((secs * 1000.0) as u64))
        }
    }

    pub fn connection_identification(&self) -> Option<String> {
        self.get_optional_string("yogi.connection.identification")
    }

    fn put(&mut self, path: &str, value: Value) {
        let mut node = &mut self.root;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            if !node.is_object() {
                *node = Value::Object(Default::default());
            }
            let map = node.as_object_mut().unwrap();
            if parts.peek().is_none() {
                map.insert(String::from(part), value);
                return;
            }
            node = map.entry(String::from(part)).or_insert(Value::Object(Default::default()));
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration::new()
    }
}

/// Merge `src` into `dest`: objects merge recursively, a `null` removes
/// the key, everything else replaces.
pub fn merge_values(dest: &mut Value, src: &Value) {
    match (dest.as_object_mut(), src.as_object()) {
        (Some(dest_map), Some(src_map)) => {
            for (key, value) in src_map {
                if value.is_null() {
                    dest_map.remove(key);
                } else if dest_map.get(key).map(|d| d.is_object()).unwrap_or(false)
                    && value.is_object()
                {
                    merge_values(dest_map.get_mut(key).unwrap(), value);
                } else {
                    dest_map.insert(key.clone(), value.clone());
                }
            }
        }
        _ => {
            if !src.is_null() {
                *dest = src.clone();
            }
        }
    }
}
