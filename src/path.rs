//! Path canonicalisation and the small byte-level helpers the routing tree
//! is built on.

/// Canonicalises a URL path: collapses duplicate slashes, resolves `.` and
/// `..` segments, and roots the result. An empty input becomes `"/"`. A
/// meaningful trailing slash survives as long as the cleaned path is longer
/// than `"/"`; `..` segments that would climb above the root are dropped.
pub fn clean_path(path: &str) -> String {
    // Work segment-wise: real segments stack up, ".." unwinds the last one.
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }

    if segments.is_empty() {
        return "/".to_string();
    }

    // a trailing empty or "." segment marks a directory-style path, a
    // trailing ".." does not
    let trailing = matches!(path.split('/').next_back(), Some("") | Some("."));

    let mut cleaned = String::with_capacity(path.len() + 2);
    for segment in segments {
        cleaned.push('/');
        cleaned.push_str(segment);
    }
    if trailing {
        cleaned.push('/');
    }
    cleaned
}

/// Joins an absolute base path with a relative one, cleaning the result.
/// If `relative` ends with a slash, so does the joined path.
pub fn join_paths(absolute: &str, relative: &str) -> String {
    if relative.is_empty() {
        return absolute.to_string();
    }

    let joined = clean_path(&format!("{}/{}", absolute, relative));

    if relative.ends_with('/') && !joined.ends_with('/') {
        return joined + "/";
    }
    joined
}

/// Length of the longest common prefix of `a` and `b`.
pub(crate) fn longest_common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Number of `:param` and `*catchall` wildcards in a registered path.
pub(crate) fn count_params(path: &str) -> usize {
    path.bytes().filter(|&c| c == b':' || c == b'*').count()
}

/// Number of `/`-separated sections in a registered path.
pub(crate) fn count_sections(path: &str) -> usize {
    path.bytes().filter(|&c| c == b'/').count()
}

/// Searches for the first wildcard segment and checks its name for invalid
/// characters. Returns the wildcard (including its `:` or `*`), its start
/// index, and whether the name is valid; `None` if the path has no wildcard.
pub(crate) fn find_wildcard(path: &[u8]) -> Option<(&[u8], usize, bool)> {
    for (start, &c) in path.iter().enumerate() {
        // A wildcard starts with ':' (param) or '*' (catch-all)
        if c != b':' && c != b'*' {
            continue;
        }

        // Find end and check for invalid characters
        let mut valid = true;
        for (end, &c) in path[start + 1..].iter().enumerate() {
            match c {
                b'/' => return Some((&path[start..start + 1 + end], start, valid)),
                b':' | b'*' => valid = false,
                _ => {}
            }
        }
        return Some((&path[start..], start, valid));
    }
    None
}
