//!
//! HTML rendering for the login UI, result pages and login emails.
//!
//! Templates are embedded at build time and filled with a plain
//! `{{placeholder}}` substitution; all user-influenced values are
//! HTML-escaped before they reach a template.
//!

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

use crate::i18n::Translator;

const LAYOUT: &str = include_str!("../templates/layout.html");
const LOGIN: &str = include_str!("../templates/login.html");
const MESSAGE: &str = include_str!("../templates/message.html");
const EMAIL_HTML: &str = include_str!("../templates/email.html");
const EMAIL_TEXT: &str = include_str!("../templates/email.txt");

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{{{name}}}}}"), value)
    })
}

/// A provider entry on the login page.
#[derive(Debug, Clone)]
pub struct ProviderLink {
    pub id: String,
    pub label: String,
    /// Asset path under `<prefix>/assets/`, e.g. `icons/google.svg`.
    pub icon: &'static str,
}

/// Everything the login page needs to render.
#[derive(Debug, Clone, Default)]
pub struct LoginView {
    pub providers: Vec<ProviderLink>,
    pub email_enabled: bool,
    pub password_enabled: bool,
    pub redirect: String,
    pub error: Option<String>,
}

/// The uniform result pages. Denials all render through here so that a
/// caller cannot distinguish why they were turned away beyond the page
/// they are shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePage {
    Forbidden,
    Denied,
    RateLimited,
    LinkInvalid,
    OauthFailed,
    Internal,
    EmailSent,
}

impl MessagePage {
    fn keys(self) -> (&'static str, &'static str) {
        match self {
            MessagePage::Forbidden => ("error.forbidden_title", "error.forbidden_message"),
            MessagePage::Denied => ("error.denied_title", "error.denied_message"),
            MessagePage::RateLimited => ("error.ratelimited_title", "error.ratelimited_message"),
            MessagePage::LinkInvalid => ("error.link_title", "error.link_message"),
            MessagePage::OauthFailed => ("error.oauth_title", "error.oauth_message"),
            MessagePage::Internal => ("error.internal_title", "error.internal_message"),
            MessagePage::EmailSent => ("email.sent_title", "email.sent_message"),
        }
    }
}

/// Rendered multipart login email.
#[derive(Debug, Clone)]
pub struct EmailBodies {
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct PageRenderer {
    service: String,
    prefix: String,
}

impl PageRenderer {
    pub fn new(service: &str, prefix: &str) -> Self {
        Self {
            service: service.to_string(),
            prefix: prefix.to_string(),
        }
    }

    fn layout(&self, lang: &str, title: &str, content: &str) -> String {
        fill(
            LAYOUT,
            &[
                ("lang", lang),
                ("title", &escape_html(title)),
                ("service", &escape_html(&self.service)),
                ("prefix", &self.prefix),
                ("content", content),
            ],
        )
    }

    pub fn login_page(&self, t: &Translator, lang: &str, view: &LoginView) -> String {
        let redirect = utf8_percent_encode(&view.redirect, NON_ALPHANUMERIC).to_string();

        let error_block = match &view.error {
            Some(message) => format!(r#"<div class="alert">{}</div>"#, escape_html(message)),
            None => String::new(),
        };

        let mut provider_buttons = String::new();
        if !view.providers.is_empty() {
            provider_buttons.push_str(r#"<div class="providers">"#);
            for p in &view.providers {
                provider_buttons.push_str(&format!(
                    r#"<a class="provider" href="{prefix}/oauth2/start?provider={id}&redirect={redirect}"><img src="{prefix}/assets/{icon}" alt="">{label}</a>"#,
                    prefix = self.prefix,
                    id = escape_html(&p.id),
                    redirect = redirect,
                    icon = p.icon,
                    label = escape_html(&t.t(lang, "login.continue_with", &[("provider", &p.label)])),
                ));
            }
            provider_buttons.push_str("</div>");
            if view.email_enabled || view.password_enabled {
                provider_buttons.push_str(&format!(
                    r#"<div class="divider">{}</div>"#,
                    escape_html(&t.t(lang, "login.or", &[]))
                ));
            }
        }

        let email_form = if view.email_enabled {
            format!(
                r#"<form method="post" action="{prefix}/email/send">
<input type="hidden" name="redirect" value="{redirect_attr}">
<label for="email">{label}</label>
<input type="email" id="email" name="email" required autocomplete="email">
<button type="submit">{submit}</button>
</form>
<form method="post" action="{prefix}/email/verify-otp">
<label for="otp">{otp_label}</label>
<input type="text" id="otp" name="otp" inputmode="numeric" autocomplete="one-time-code">
<button type="submit">{otp_submit}</button>
</form>"#,
                prefix = self.prefix,
                redirect_attr = escape_html(&view.redirect),
                label = escape_html(&t.t(lang, "login.email_label", &[])),
                submit = escape_html(&t.t(lang, "login.email_submit", &[])),
                otp_label = escape_html(&t.t(lang, "login.otp_label", &[])),
                otp_submit = escape_html(&t.t(lang, "login.otp_submit", &[])),
            )
        } else {
            String::new()
        };

        let password_form = if view.password_enabled {
            format!(
                r#"<form method="post" action="{prefix}/password/login">
<input type="hidden" name="redirect" value="{redirect_attr}">
<label for="password">{label}</label>
<input type="password" id="password" name="password" required>
<button type="submit">{submit}</button>
</form>"#,
                prefix = self.prefix,
                redirect_attr = escape_html(&view.redirect),
                label = escape_html(&t.t(lang, "login.password_label", &[])),
                submit = escape_html(&t.t(lang, "login.password_submit", &[])),
            )
        } else {
            String::new()
        };

        let heading = t.t(lang, "login.heading", &[("service", &self.service)]);
        let content = fill(
            LOGIN,
            &[
                ("heading", &escape_html(&heading)),
                ("error_block", &error_block),
                ("provider_buttons", &provider_buttons),
                ("email_form", &email_form),
                ("password_form", &password_form),
            ],
        );
        self.layout(lang, &t.t(lang, "login.title", &[]), &content)
    }

    pub fn message_page(
        &self,
        t: &Translator,
        lang: &str,
        page: MessagePage,
        redirect: &str,
    ) -> String {
        let (title_key, message_key) = page.keys();
        let title = t.t(lang, title_key, &[]);
        let content = fill(
            MESSAGE,
            &[
                ("title", &escape_html(&title)),
                ("message", &escape_html(&t.t(lang, message_key, &[]))),
                ("prefix", &self.prefix),
                (
                    "redirect",
                    &utf8_percent_encode(redirect, NON_ALPHANUMERIC).to_string(),
                ),
                ("back_label", &escape_html(&t.t(lang, "error.back_to_login", &[]))),
            ],
        );
        self.layout(lang, &title, &content)
    }

    pub fn logout_page(&self, t: &Translator, lang: &str) -> String {
        let title = t.t(lang, "logout.title", &[]);
        let content = format!(
            r#"<h1>{title}</h1>
<p>{message}</p>
<p><a class="button" href="{prefix}/login">{again}</a></p>"#,
            title = escape_html(&title),
            message = escape_html(&t.t(lang, "logout.message", &[])),
            prefix = self.prefix,
            again = escape_html(&t.t(lang, "logout.again", &[])),
        );
        self.layout(lang, &title, &content)
    }

    /// Render the multipart login email. The plaintext part carries the
    /// bare login URL and the OTP so any client can retrieve them.
    pub fn email_bodies(
        &self,
        t: &Translator,
        lang: &str,
        login_url: &str,
        otp_display: &str,
        valid_minutes: u64,
    ) -> EmailBodies {
        let minutes = valid_minutes.to_string();
        let title = t.t(lang, "login.title", &[]);
        let greeting = t.t(lang, "email.greeting", &[]);
        let link_instruction = t.t(lang, "email.link_instruction", &[("service", &self.service)]);
        let otp_instruction = t.t(lang, "email.otp_instruction", &[]);
        let expiry_note = t.t(lang, "email.expiry_note", &[("minutes", &minutes)]);
        let vars: Vec<(&str, &str)> = vec![
            ("lang", lang),
            ("title", &title),
            ("greeting", &greeting),
            ("link_instruction", &link_instruction),
            ("otp_instruction", &otp_instruction),
            ("expiry_note", &expiry_note),
            ("login_url", login_url),
            ("otp", otp_display),
        ];
        EmailBodies {
            subject: t.t(lang, "email.subject", &[("service", &self.service)]),
            html: fill(EMAIL_HTML, &vars),
            text: fill(EMAIL_TEXT, &vars),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer() -> (PageRenderer, Translator) {
        (PageRenderer::new("ChatbotGate", "/_auth"), Translator::new("en"))
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<b>&"quote"'</b>"#),
            "&lt;b&gt;&amp;&quot;quote&quot;&#39;&lt;/b&gt;"
        );
    }

    #[test]
    fn test_login_page_lists_enabled_methods() {
        let (r, t) = renderer();
        let view = LoginView {
            providers: vec![ProviderLink {
                id: "google".to_string(),
                label: "Google".to_string(),
                icon: "icons/google.svg",
            }],
            email_enabled: true,
            password_enabled: true,
            redirect: "/private".to_string(),
            error: None,
        };
        let html = r.login_page(&t, "en", &view);
        assert!(html.contains("/_auth/oauth2/start?provider=google&redirect=%2Fprivate"));
        assert!(html.contains("/_auth/email/send"));
        assert!(html.contains("/_auth/password/login"));
        assert!(html.contains("Sign in to ChatbotGate"));
        assert!(!html.contains("{{"));
    }

    #[test]
    fn test_login_page_hides_disabled_methods() {
        let (r, t) = renderer();
        let html = r.login_page(
            &t,
            "en",
            &LoginView {
                redirect: "/".to_string(),
                ..Default::default()
            },
        );
        assert!(!html.contains("oauth2/start"));
        assert!(!html.contains("email/send"));
        assert!(!html.contains("password/login"));
    }

    #[test]
    fn test_message_page_escapes_and_links_back() {
        let (r, t) = renderer();
        let html = r.message_page(&t, "en", MessagePage::Forbidden, "/private");
        assert!(html.contains("Access denied"));
        assert!(html.contains("/_auth/login?redirect=%2Fprivate"));
    }

    #[test]
    fn test_email_bodies_carry_url_and_otp() {
        let (r, t) = renderer();
        let bodies = r.email_bodies(
            &t,
            "en",
            "https://gate.example.com/_auth/email/verify?token=abc",
            "1234 5678",
            15,
        );
        assert!(bodies.text.contains("https://gate.example.com/_auth/email/verify?token=abc"));
        assert!(bodies.text.contains("1234 5678"));
        assert!(bodies.html.contains("token=abc"));
        assert!(bodies.html.contains("1234 5678"));
        assert_eq!(bodies.subject, "Sign in to ChatbotGate");
        assert!(bodies.text.contains("15 minutes"));
    }

    #[test]
    fn test_japanese_page_renders() {
        let r = PageRenderer::new("ゲート", "/_auth");
        let t = Translator::new("ja");
        let html = r.message_page(&t, "ja", MessagePage::EmailSent, "/");
        assert!(html.contains("メールをご確認ください"));
    }
}
