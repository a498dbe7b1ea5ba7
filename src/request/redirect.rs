//! Redirect policy.

use url::Url;

use crate::errors::ErrorKind;
use crate::request::Method;

/// What to do with a completed leg.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RedirectDecision {
    /// Hand the reply to the caller.
    Deliver,
    /// Send another leg. `strip_body` is set when the method was downgraded.
    Follow {
        url: Url,
        method: Method,
        strip_body: bool,
    },
    /// Settle with an error; the reply is attached as the response.
    Fail(ErrorKind),
}

/// Decides how to continue after a reply with `status` and `location`.
///
/// `max_redirects == 0` disables following and delivers the 3xx itself.
pub(crate) fn decide(
    status: u16,
    location: Option<&str>,
    current: &Url,
    method: Method,
    redirect_count: u32,
    max_redirects: u32,
) -> RedirectDecision {
    let Some(location) = location else {
        return RedirectDecision::Deliver;
    };
    if max_redirects == 0 {
        return RedirectDecision::Deliver;
    }
    if redirect_count >= max_redirects {
        return RedirectDecision::Fail(ErrorKind::TooManyRedirects(max_redirects));
    }

    let url = match current.join(location) {
        Ok(url) => url,
        Err(e) => return RedirectDecision::Fail(ErrorKind::InvalidUrl(format!("{location}: {e}"))),
    };
    if url.scheme() == "file" {
        return RedirectDecision::Fail(ErrorKind::InvalidRedirectScheme(url.to_string()));
    }

    let next = match status {
        301 | 302 if method == Method::Post => Method::Get,
        301 | 302 | 307 | 308 => method,
        303 if method == Method::Head => Method::Head,
        303 => Method::Get,
        other => return RedirectDecision::Fail(ErrorKind::UnhandledRedirect(other)),
    };

    RedirectDecision::Follow {
        url,
        method: next,
        strip_body: next != method,
    }
}
