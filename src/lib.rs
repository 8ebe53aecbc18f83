#![deny(clippy::unwrap_used)]

use serde::de::IntoDeserializer;
use serde::Deserialize;

pub mod category;
pub mod config;
pub mod import;
pub mod import_throttle;
pub mod product;
pub mod store;
pub mod url_rewrite;

/// Treats a blank cell as a missing value.
pub fn empty_string_as_none<'de, D, T>(de: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::Deserialize<'de>,
{
    let opt = Option::<String>::deserialize(de)?;
    match opt.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => T::deserialize(s.into_deserializer()).map(Some),
    }
}

pub fn empty_string_as_none_parse<'de, D, T>(de: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: std::str::FromStr,
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    let opt = Option::<String>::deserialize(de)?;
    match opt.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s
            .parse()
            .map_err(|err| serde::de::Error::custom(format!("{err:?}")))
            .map(Some),
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use futures::stream::StreamExt;

    #[derive(Deserialize, Debug)]
    struct Row {
        #[serde(deserialize_with = "empty_string_as_none")]
        code: Option<String>,
        #[serde(deserialize_with = "empty_string_as_none_parse")]
        parent: Option<i64>,
    }

    async fn rows(data: &str) -> Vec<Result<Row, csv_async::Error>> {
        let mut rdr = csv_async::AsyncReaderBuilder::new()
            .delimiter(b',')
            .create_deserializer(data.as_bytes());
        rdr.deserialize::<Row>().collect().await
    }

    #[tokio::test]
    async fn blank_cells_become_none() {
        let mut parsed = rows("code,parent\n ,\nch_DE, 2\n").await.into_iter();
        let row = parsed.next().expect("row").expect("parsed");
        assert_eq!((row.code, row.parent), (None, None));
        let row = parsed.next().expect("row").expect("parsed");
        assert_eq!((row.code.as_deref(), row.parent), (Some("ch_DE"), Some(2)));
        assert!(rows("code,parent\nx,y\n").await[0].is_err());
    }
}
