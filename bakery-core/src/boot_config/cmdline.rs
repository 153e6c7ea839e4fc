//! Kernel command line (`cmdline.txt`) as an ordered list of parameters.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub key: String,
    /// `None` for bare flags such as `quiet`.
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cmdline {
    params: Vec<Param>,
}

impl Cmdline {
    /// Split on whitespace; each token is `key` or `key=value`, split at the
    /// first `=`.
    pub fn parse(contents: &str) -> Self {
        let params = contents
            .split_whitespace()
            .map(|token| match token.split_once('=') {
                Some((key, value)) => Param {
                    key: key.to_string(),
                    value: Some(value.to_string()),
                },
                None => Param {
                    key: token.to_string(),
                    value: None,
                },
            })
            .collect();
        Self { params }
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Value of `key`, `None` when absent or bare.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.key == key)
            .and_then(|p| p.value.as_deref())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.iter().any(|p| p.key == key)
    }

    /// Replace `key` in place, or append it when absent.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.params.iter_mut().find(|p| p.key == key) {
            Some(param) => param.value = Some(value.to_string()),
            None => self.params.push(Param {
                key: key.to_string(),
                value: Some(value.to_string()),
            }),
        }
    }
}

impl fmt::Display for Cmdline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match &param.value {
                Some(value) => write!(f, "{}={}", param.key, value)?,
                None => f.write_str(&param.key)?,
            }
        }
        Ok(())
    }
}
