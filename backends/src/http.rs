use offsite_core::Error;
use reqwest::{Response, StatusCode};

const MAX_ERROR_BODY: usize = 512;

pub(crate) fn transport_error(error: reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::Network(format!("request timed out: {}", error))
    } else {
        Error::Network(error.to_string())
    }
}

/// Passes successful responses through and turns everything else into an [`Error`].
pub(crate) async fn check_status(response: Response) -> Result<Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }

    if status == StatusCode::UNAUTHORIZED {
        return Err(Error::Unauthorized(format!("{} rejected credentials: {}", url, body)));
    }

    Err(Error::http(status.as_u16(), format!("{}: {}", url, body.trim())))
}
