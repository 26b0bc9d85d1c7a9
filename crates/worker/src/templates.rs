//! Rendered transactional emails.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailTemplate {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Link sent in password reset emails.
pub fn reset_url(frontend_url: &str, reset_token: &str) -> String {
    format!(
        "{}/auth/reset-password?token={}",
        frontend_url.trim_end_matches('/'),
        reset_token
    )
}

/// Fallback display name: the local part of the address.
pub fn name_from_email(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}

pub fn welcome_email(name: &str) -> EmailTemplate {
    let html_name = escape_html(name);
    EmailTemplate {
        subject: "Welcome to Courier!".to_string(),
        html: format!(
            r#"<html>
  <body style="font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto; padding: 20px;">
    <div style="background: #4f46e5; padding: 30px; border-radius: 10px; color: white; text-align: center;">
      <h1 style="margin: 0; font-size: 28px;">Welcome to Courier!</h1>
    </div>
    <div style="padding: 30px; background-color: #f8f9fa;">
      <h2 style="color: #333; margin-top: 0;">Hello {html_name}!</h2>
      <p style="color: #666; line-height: 1.6;">Your account has been created.</p>
      <p style="color: #666; line-height: 1.6;">
        <strong>Next steps:</strong><br>
        &bull; Complete your profile<br>
        &bull; Explore the available features<br>
        &bull; Contact support if you need help
      </p>
      <p style="color: #666; margin-bottom: 0;">Best regards,<br>The Courier Team</p>
    </div>
  </body>
</html>"#
        ),
        text: format!(
            "Welcome to Courier!\n\n\
             Hello {name}!\n\n\
             Your account has been created.\n\n\
             Next steps:\n\
             - Complete your profile\n\
             - Explore the available features\n\
             - Contact support if you need help\n\n\
             Best regards,\n\
             The Courier Team\n"
        ),
    }
}

pub fn password_reset_email(name: &str, reset_url: &str) -> EmailTemplate {
    let html_name = escape_html(name);
    let href = escape_html(reset_url);
    EmailTemplate {
        subject: "Password Reset Request - Courier".to_string(),
        html: format!(
            r#"<html>
  <body style="font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto; padding: 20px;">
    <div style="background: #e11d48; padding: 30px; border-radius: 10px; color: white; text-align: center;">
      <h1 style="margin: 0; font-size: 28px;">Password Reset Request</h1>
    </div>
    <div style="padding: 30px; background-color: #f8f9fa;">
      <p style="color: #666; line-height: 1.6;">
        Hello {html_name}, we received a request to reset the password of your Courier account.
      </p>
      <p style="text-align: center; margin: 30px 0;">
        <a href="{href}" style="background: #e11d48; color: white; padding: 15px 30px; text-decoration: none; border-radius: 25px; font-weight: bold;">Reset My Password</a>
      </p>
      <p style="color: #333;"><strong>Security note:</strong> this link expires in 1 hour.</p>
      <p style="color: #666; line-height: 1.6;">
        If you did not request a reset, ignore this email. Your password stays unchanged.
      </p>
      <p style="color: #999; font-size: 14px;">
        If the button does not work, paste this link into your browser:<br>
        <span style="word-break: break-all;">{href}</span>
      </p>
      <p style="color: #666; margin-bottom: 0;">Best regards,<br>The Courier Team</p>
    </div>
  </body>
</html>"#
        ),
        text: format!(
            "Password Reset Request\n\n\
             Hello {name}, we received a request to reset the password of your Courier account.\n\n\
             To reset your password, visit:\n\
             {reset_url}\n\n\
             This link expires in 1 hour.\n\n\
             If you did not request a reset, ignore this email. Your password stays unchanged.\n\n\
             Best regards,\n\
             The Courier Team\n"
        ),
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
