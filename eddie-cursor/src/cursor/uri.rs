//! Row identifier forwarding
//!
//! Identifiers handed out by the cursor route back through it instead of
//! pointing straight at the backing authority:
//!
//! `content://mail.provider/conversation/7` becomes
//! `content://<local authority>/mail.provider/conversation/7`
//!
//! Identifiers received back for mutation requests are un-forwarded before
//! dispatch.

use url::Url;

use crate::types::error::CursorError;
use crate::types::RowId;

fn parse(id: &RowId) -> Result<Url, CursorError> {
    let url = Url::parse(id.as_str())?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(CursorError::InvalidUri(format!(
            "Row identifier has no authority: {}",
            id
        )));
    }
    Ok(url)
}

fn suffix(url: &Url) -> String {
    let mut out = String::new();
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

/// The backing authority a row identifier belongs to
///
/// Forwarded identifiers report the original authority.
pub fn authority_of(id: &RowId, local_authority: &str) -> Result<String, CursorError> {
    let original = unforward(id, local_authority)?;
    let url = parse(&original)?;
    Ok(url.host_str().unwrap_or_default().to_string())
}

/// Whether an identifier is already in forwarded form
pub fn is_forwarded(id: &RowId, local_authority: &str) -> bool {
    Url::parse(id.as_str())
        .map(|url| url.host_str() == Some(local_authority))
        .unwrap_or(false)
}

/// Rewrite a backing identifier into its forwarded form
pub fn forward(id: &RowId, local_authority: &str) -> Result<RowId, CursorError> {
    let url = parse(id)?;
    let authority = url.host_str().unwrap_or_default();
    if authority == local_authority {
        return Ok(id.clone());
    }

    Ok(RowId::new(format!(
        "{}://{}/{}{}{}",
        url.scheme(),
        local_authority,
        authority,
        url.path(),
        suffix(&url)
    )))
}

/// Recover the backing identifier from a forwarded one
///
/// Identifiers that are not forwarded are returned unchanged.
pub fn unforward(id: &RowId, local_authority: &str) -> Result<RowId, CursorError> {
    let url = parse(id)?;
    if url.host_str() != Some(local_authority) {
        return Ok(id.clone());
    }

    let path = url.path().trim_start_matches('/');
    let (authority, rest) = match path.find('/') {
        Some(idx) => (&path[..idx], &path[idx..]),
        None => (path, ""),
    };
    if authority.is_empty() {
        return Err(CursorError::InvalidUri(format!(
            "Forwarded identifier carries no original authority: {}",
            id
        )));
    }

    Ok(RowId::new(format!(
        "{}://{}{}{}",
        url.scheme(),
        authority,
        rest,
        suffix(&url)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: &str = "eddie.cursor.provider";

    #[test]
    fn test_forward() {
        let id = RowId::from("content://mail.provider/conversation/7?account=a%40b");
        let forwarded = forward(&id, LOCAL).unwrap();
        assert_eq!(
            forwarded.as_str(),
            "content://eddie.cursor.provider/mail.provider/conversation/7?account=a%40b"
        );
        assert!(is_forwarded(&forwarded, LOCAL));
        assert!(!is_forwarded(&id, LOCAL));

        // Already forwarded identifiers are left alone
        assert_eq!(forward(&forwarded, LOCAL).unwrap(), forwarded);
    }

    #[test]
    fn test_unforward_inverts_forward() {
        let id = RowId::from("content://mail.provider/conversation/7#top");
        let forwarded = forward(&id, LOCAL).unwrap();
        assert_eq!(unforward(&forwarded, LOCAL).unwrap(), id);

        // Plain identifiers pass through
        assert_eq!(unforward(&id, LOCAL).unwrap(), id);
    }

    #[test]
    fn test_authority_of() {
        let id = RowId::from("content://work.provider/conversation/1");
        assert_eq!(authority_of(&id, LOCAL).unwrap(), "work.provider");

        let forwarded = forward(&id, LOCAL).unwrap();
        assert_eq!(authority_of(&forwarded, LOCAL).unwrap(), "work.provider");
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(matches!(
            forward(&RowId::from("not a uri"), LOCAL),
            Err(CursorError::InvalidUri(_))
        ));
        assert!(matches!(
            unforward(&RowId::from("content://eddie.cursor.provider/"), LOCAL),
            Err(CursorError::InvalidUri(_))
        ));
    }
}
