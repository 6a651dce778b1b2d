//! Operator-facing message catalog.
//!
//! Strings are keyed; the catalog picks the language configured in
//! `language`. Unknown languages fall back to English, unknown keys to
//! the key itself so a missing translation never hides a message.

type Entry = (&'static str, &'static str);

const EN: &[Entry] = &[
    ("Hello", "Welcome {firstname} {lastname}."),
    ("Goodbye", "Goodbye {firstname} {lastname}."),
    ("Email", "Email"),
    ("Firstname", "First name"),
    ("Lastname", "Last name"),
    ("Job", "Job"),
    ("ID", "ID"),
    ("Name", "Name"),
    ("IP", "IP"),
    ("AgentPort", "Agent port"),
    ("MeCaption", "Your profile"),
    ("ListCaption", "Accessible machines"),
    ("MeShortDesc", "Display your profile"),
    ("ListShortDesc", "List the machines you can access"),
    ("ConnectShortDesc", "Open a shell on a machine"),
    ("LogoutShortDesc", "Return to the login prompt"),
    ("ExitShortDesc", "Sign out and quit"),
];

const FR: &[Entry] = &[
    ("Hello", "Bienvenue {firstname} {lastname}."),
    ("Goodbye", "Au revoir {firstname} {lastname}."),
    ("Email", "Courriel"),
    ("Firstname", "Prénom"),
    ("Lastname", "Nom"),
    ("Job", "Métier"),
    ("ID", "ID"),
    ("Name", "Nom"),
    ("IP", "IP"),
    ("AgentPort", "Port de l'agent"),
    ("MeCaption", "Votre profil"),
    ("ListCaption", "Machines accessibles"),
    ("MeShortDesc", "Afficher votre profil"),
    ("ListShortDesc", "Lister les machines accessibles"),
    ("ConnectShortDesc", "Ouvrir un shell sur une machine"),
    ("LogoutShortDesc", "Revenir à l'invite de connexion"),
    ("ExitShortDesc", "Se déconnecter et quitter"),
];

/// Message catalog for one language.
pub struct Catalog {
    entries: &'static [Entry],
}

impl Catalog {
    pub fn new(language: &str) -> Self {
        let entries = match language {
            "fr" => FR,
            _ => EN,
        };
        Self { entries }
    }

    /// Look a key up, falling back to English and then to the key itself.
    pub fn text(&self, key: &str) -> String {
        self.entries
            .iter()
            .chain(EN.iter())
            .find(|(k, _)| *k == key)
            .map(|(_, v)| (*v).to_string())
            .unwrap_or_else(|| key.to_string())
    }

    /// Look a templated key up and substitute `{firstname}`/`{lastname}`.
    pub fn greeting(&self, key: &str, firstname: &str, lastname: &str) -> String {
        self.text(key)
            .replace("{firstname}", firstname)
            .replace("{lastname}", lastname)
    }
}
