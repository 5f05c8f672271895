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

/*! Paths within the global terminal name tree.

A path is a UTF-8 string of segments separated by `/`. It is absolute
iff it starts with `/`; the root is `/` itself. Empty segments are
forbidden except at the root, so `//` never appears and a non-root path
never ends in `/`.
*/

use std::fmt;

use crate::errors::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    s: String,
}

impl Path {
    /// Parse a path, rejecting empty segments. A single trailing slash
    /// on a non-root path is dropped.
    pub fn new<S: Into<String>>(s: S) -> Result<Path> {
        let mut s = s.into();
        if s.contains("//") {
            return Err(Error::InvalidPath(s));
        }

        if s.len() > 1 && s.ends_with('/') {
            s.pop();
        }

        Ok(Path { s })
    }

    pub fn root() -> Path {
        Path { s: String::from("/") }
    }

    pub fn as_str(&self) -> &str {
        &self.s
    }

    pub fn empty(&self) -> bool {
        self.s.is_empty()
    }

    pub fn len(&self) -> usize {
        self.s.len()
    }

    pub fn is_empty(&self) -> bool {
        self.s.is_empty()
    }

    pub fn clear(&mut self) {
        self.s.clear();
    }

    pub fn is_absolute(&self) -> bool {
        self.s.starts_with('/')
    }

    pub fn is_root(&self) -> bool {
        self.s == "/"
    }

    /// Append a relative path. Joining with an absolute right operand
    /// fails with *invalid-path*.
    pub fn join(&self, other: &Path) -> Result<Path> {
        if other.is_absolute() {
            return Err(Error::InvalidPath(other.s.clone()));
        }

        if self.is_root() {
            Path::new(format!("{}{}", self.s, other.s))
        } else {
            Path::new(format!("{}/{}", self.s, other.s))
        }
    }

    pub fn join_str(&self, other: &str) -> Result<Path> {
        self.join(&Path::new(other)?)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_empty_segments() {
        let cases = vec!["//", "a//b", "//x", "/Test//"];
        for src in cases {
            assert!(Path::new(src).is_err(), "'{src}' should be invalid");
        }
    }

    #[test]
    fn parses_and_normalizes() {
        let cases = vec![
            ("", ""),
            ("/", "/"),
            ("/Test", "/Test"),
            ("Test", "Test"),
            ("Test/", "Test"),
            ("/Test/tmp", "/Test/tmp"),
        ];

        for (src, want) in cases {
            let path = Path::new(src).expect("path to parse");
            assert_eq!(want, path.to_string());
        }
    }

    #[test]
    fn flags() {
        assert!(Path::new("/").unwrap().is_root());
        assert!(Path::new("/").unwrap().is_absolute());
        assert!(!Path::new("Test").unwrap().is_absolute());
        assert!(!Path::new("/Test").unwrap().is_root());
        assert!(Path::new("").unwrap().empty());

        let mut path = Path::new("/Test").unwrap();
        path.clear();
        assert!(path.empty());
        assert!(!path.is_root());
    }

    #[test]
    fn joining() {
        let base = Path::new("/Test").unwrap();
        assert_eq!(Path::new("/Test/tmp").unwrap(), base.join_str("tmp").unwrap());
        assert_eq!(Path::new("/tmp").unwrap(), Path::root().join_str("tmp").unwrap());

        // joining with an absolute right operand must fail
        assert!(base.join(&Path::new("/tmp").unwrap()).is_err());
        assert!(matches!(base.join_str("/tmp"), Err(Error::InvalidPath(_))));
    }
}
