use super::codec::filter_copy;
use super::{ArchiveError, EntryInfo, Result, DEFAULT_MANIFEST_NAME};
use glob::{MatchOptions, Pattern};
use std::io::{Read, Write};
use tar::Builder;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A set of glob patterns matched against normalized entry names.
///
/// `*` stays within one path segment, `**` spans any number of segments.
#[derive(Debug, Clone, Default)]
pub struct PathPatterns {
    patterns: Vec<Pattern>,
}

impl PathPatterns {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                Pattern::new(super::normalize_entry_name(p).trim_start_matches('/')).map_err(
                    |source| ArchiveError::InvalidPattern {
                        pattern: p.to_string(),
                        source,
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| p.matches_with(path, MATCH_OPTIONS))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Assemble the file set an evaluation runs against.
///
/// Visible answer files are taken from `answer`; everything hidden or protected
/// comes from the pristine `task` files, so learners cannot tamper with tests. The
/// task manifest always counts as hidden.
pub fn merge_for_evaluation<A, T, W>(
    answer: A,
    task: T,
    hidden: &PathPatterns,
    protected: &PathPatterns,
    writer: W,
) -> Result<W>
where
    A: Read,
    T: Read,
    W: Write,
{
    let from_task =
        |info: &EntryInfo| is_hidden(hidden, info) || protected.matches(&info.path);

    let mut builder = Builder::new(writer);
    filter_copy(answer, &mut builder, |info| !from_task(info))?;
    filter_copy(task, &mut builder, from_task)?;
    Ok(builder.into_inner()?)
}

fn is_hidden(hidden: &PathPatterns, info: &EntryInfo) -> bool {
    info.path == DEFAULT_MANIFEST_NAME || hidden.matches(&info.path)
}
