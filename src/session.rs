use crate::error::{Error, Result};
use crate::settings::Settings;

/// The signed-in user, validated once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub display_name: Option<String>,
}

impl Session {
    /// `override_user` (from the command line) wins over the config file.
    pub fn resolve(settings: &Settings, override_user: Option<&str>) -> Result<Self> {
        let user_id = override_user
            .map(str::to_string)
            .or_else(|| settings.session.user_id.clone())
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or(Error::MissingUserId)?;

        Ok(Self {
            user_id,
            display_name: settings.session.display_name.clone(),
        })
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_comes_from_cli_first() {
        let settings = Settings::parse("[session]\nuser_id = \"7\"\ndisplay_name = \"Kim\"").unwrap();
        assert_eq!(Session::resolve(&settings, None).unwrap().user_id, "7");
        let s = Session::resolve(&settings, Some(" 9 ")).unwrap();
        assert_eq!(s.user_id, "9");
        assert_eq!(s.label(), "Kim");
    }

    #[test]
    fn blank_user_id_is_rejected() {
        let settings = Settings::parse("[session]\nuser_id = \"  \"").unwrap();
        assert!(matches!(Session::resolve(&settings, None), Err(Error::MissingUserId)));
        assert!(matches!(
            Session::resolve(&Settings::default(), Some("")),
            Err(Error::MissingUserId)
        ));
    }
}
