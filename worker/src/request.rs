// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

use futures_util::Stream;
use reqwest::Result;
use url::Url;

/// Build a download client for one fetch session.
///
/// A fresh client is built per session rather than cached so that proxy
/// settings changed over `SET_ENV` take effect on the next operation.
pub fn client() -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ))
        .build()
        .expect("build reqwest client")
}

/// Fetch a resource at the provided [`Url`] and stream its response bytes,
/// optionally resuming from `offset`.
pub async fn get(
    client: &reqwest::Client,
    url: Url,
    offset: u64,
) -> Result<(Option<u64>, impl Stream<Item = Result<bytes::Bytes>>)> {
    let mut request = client.get(url);
    if offset > 0 {
        request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
    }

    let response = request.send().await?.error_for_status()?;
    let length = response.content_length();

    Ok((length, response.bytes_stream()))
}
