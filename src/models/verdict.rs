use std::fmt;

/// Answer written back for every input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Ok,
    Block,
}

impl Verdict {
    /// Wire token for this verdict.
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Ok => "OK",
            Verdict::Block => "BLOCK",
        }
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Verdict::Block)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
