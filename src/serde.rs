use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::de::{self, value::MapAccessDeserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};
use void::{ResultVoidExt, Void};

/// Parses a bare string, a list of strings, or a map.
///
/// A list is a sequence of shell steps: it is joined with ` && ` and then parsed like a bare
/// string, so a later step only runs if the earlier ones succeeded.
/// https://serde.rs/string-or-struct.html
pub fn shell_steps_or_mapping<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: Deserialize<'de> + FromStr<Err = Void>,
    D: Deserializer<'de>,
{
    struct ShellStepsOrMapping<T>(PhantomData<fn() -> T>);

    impl<'de, T> Visitor<'de> for ShellStepsOrMapping<T>
    where
        T: Deserialize<'de> + FromStr<Err = Void>,
    {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("string, list of strings, or mapping")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(T::from_str(value).void_unwrap())
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: SeqAccess<'de>,
        {
            let mut steps: Vec<String> = Vec::new();
            while let Some(step) = seq.next_element::<String>()? {
                steps.push(step);
            }
            if steps.is_empty() {
                return Err(de::Error::invalid_length(0, &self));
            }
            Ok(T::from_str(&steps.join(" && ")).void_unwrap())
        }

        fn visit_map<M>(self, map: M) -> Result<Self::Value, M::Error>
        where
            M: MapAccess<'de>,
        {
            Deserialize::deserialize(MapAccessDeserializer::new(map))
        }
    }

    deserializer.deserialize_any(ShellStepsOrMapping(PhantomData))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ShellSteps {
    One(String),
    Many(Vec<String>),
}

/// Parses a shell command given as a string or a list of steps, for use with
/// `#[serde(default, deserialize_with = "...")]` on an `Option<String>` field.
pub fn optional_shell_steps<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match ShellSteps::deserialize(deserializer)? {
        ShellSteps::One(command) => Ok(Some(command)),
        ShellSteps::Many(steps) if steps.is_empty() => {
            Err(de::Error::custom("command list must not be empty"))
        }
        ShellSteps::Many(steps) => Ok(Some(steps.join(" && "))),
    }
}

/// Serializes durations as (fractional) seconds.
pub mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        f64::deserialize(deserializer).map(Duration::from_secs_f64)
    }
}
