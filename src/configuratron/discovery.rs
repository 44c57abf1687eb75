use crate::error::{Dn3Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Subject,
    Session,
}

/// A file stem template such as `S{subject}R{session}`.
///
/// Placeholders match lazily up to the next literal; a trailing placeholder
/// takes the rest of the stem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilenameFormat {
    segments: Vec<Segment>,
}

impl FilenameFormat {
    pub fn parse(format: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = format;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let close = rest[open..].find('}').ok_or_else(|| {
                Dn3Error::invalid("filename_format", format!("unclosed `{{` in `{format}`"))
            })? + open;
            segments.push(match &rest[open + 1..close] {
                "subject" => Segment::Subject,
                "session" => Segment::Session,
                other => {
                    return Err(Dn3Error::invalid(
                        "filename_format",
                        format!("unknown field `{other}`, expected subject or session"),
                    ));
                }
            });
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        if !segments.contains(&Segment::Subject) {
            return Err(Dn3Error::invalid(
                "filename_format",
                format!("`{format}` has no {{subject}} field"),
            ));
        }
        if segments
            .windows(2)
            .any(|w| !matches!(w[0], Segment::Literal(_)) && !matches!(w[1], Segment::Literal(_)))
        {
            return Err(Dn3Error::invalid(
                "filename_format",
                format!("fields in `{format}` must be separated by literal text"),
            ));
        }
        Ok(FilenameFormat { segments })
    }

    /// `(subject, session)` parsed from `stem`, or `None` when it does not fit.
    pub fn matches(&self, stem: &str) -> Option<(String, Option<String>)> {
        let mut subject = None;
        let mut session = None;
        let mut rest = stem;
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(text) => rest = rest.strip_prefix(text.as_str())?,
                field => {
                    let end = match self.segments.get(i + 1) {
                        Some(Segment::Literal(next)) => rest.find(next.as_str())?,
                        _ => rest.len(),
                    };
                    if end == 0 {
                        return None;
                    }
                    let value = rest[..end].to_string();
                    rest = &rest[end..];
                    if *field == Segment::Subject {
                        subject = Some(value);
                    } else {
                        session = Some(value);
                    }
                }
            }
        }
        if !rest.is_empty() {
            return None;
        }
        subject.map(|s| (s, session))
    }
}

/// A discovered recording file and the thinker/session it belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionFile {
    pub thinker: String,
    pub session: String,
    pub path: PathBuf,
}

fn normalise_extension(ext: &str) -> String {
    ext.trim_start_matches('.').to_ascii_lowercase()
}

/// Every file below `toplevel` with one of `extensions`, in sorted order.
pub fn find_recordings(toplevel: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !toplevel.is_dir() {
        return Err(Dn3Error::invalid(
            "toplevel",
            format!("{} is not a directory", toplevel.display()),
        ));
    }
    let wanted: Vec<String> = extensions.iter().map(|e| normalise_extension(e)).collect();
    let pattern = Path::new(&glob::Pattern::escape(&toplevel.to_string_lossy()))
        .join("**")
        .join("*");
    let mut found = Vec::new();
    for entry in glob::glob(&pattern.to_string_lossy())? {
        let path = entry?;
        let keep = path.is_file()
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| wanted.contains(&normalise_extension(e)));
        if keep {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Assign each file a thinker and session.
///
/// Without a format the thinker is the parent directory name and the session the
/// file stem. Files that do not fit the format are skipped.
pub fn identify_sessions(files: Vec<PathBuf>, format: Option<&FilenameFormat>) -> Vec<SessionFile> {
    files
        .into_iter()
        .filter_map(|path| {
            let stem = path.file_stem()?.to_string_lossy().into_owned();
            let parent = path
                .parent()
                .and_then(Path::file_name)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (thinker, session) = match format {
                None => (parent, stem),
                Some(format) => match format.matches(&stem) {
                    Some((subject, session)) => (subject, session.unwrap_or(stem)),
                    None => {
                        log::warn!("Skipping {}: name does not fit the filename format", path.display());
                        return None;
                    }
                },
            };
            Some(SessionFile {
                thinker,
                session,
                path,
            })
        })
        .collect()
}

/// Group files by thinker, dropping excluded thinkers and sessions.
pub fn group_thinkers(
    files: Vec<SessionFile>,
    exclude_people: &[glob::Pattern],
    exclude_sessions: &[glob::Pattern],
) -> BTreeMap<String, Vec<SessionFile>> {
    let mut thinkers: BTreeMap<String, Vec<SessionFile>> = BTreeMap::new();
    for file in files {
        if exclude_people.iter().any(|p| p.matches(&file.thinker)) {
            continue;
        }
        if exclude_sessions.iter().any(|p| p.matches(&file.session)) {
            log::debug!("Excluding session {}/{}", file.thinker, file.session);
            continue;
        }
        thinkers.entry(file.thinker.clone()).or_default().push(file);
    }
    thinkers
}
