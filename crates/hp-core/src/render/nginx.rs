use crate::layout::{HostLayout, TlsPaths};
use crate::model::{Site, SiteKind, WwwRedirect};

use super::{directive_value, RenderError};

/// Where the main server block sends requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    /// Files straight from the document root.
    Static,
    /// PHP through a FastCGI unix socket.
    Php { socket: String },
    /// An application listening on localhost.
    Proxy { port: u16 },
}

/// Everything needed to render one site's vhost file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhostModel {
    pub domain: String,
    pub www_redirect: WwwRedirect,
    pub document_root: String,
    pub upstream: Upstream,
    /// Present only when a certificate exists on disk.
    pub tls: Option<TlsPaths>,
    pub client_max_body_size: String,
}

impl VhostModel {
    pub fn for_site(
        site: &Site,
        layout: &HostLayout,
        tls: Option<TlsPaths>,
    ) -> Result<Self, RenderError> {
        let upstream = match site.kind {
            SiteKind::Static => Upstream::Static,
            SiteKind::Php => {
                let version = site.php_version.as_deref().ok_or(RenderError::MissingField {
                    template: "php vhost",
                    field: "php_version",
                })?;
                Upstream::Php {
                    socket: layout.php_fpm_socket(version, &site.pool_name()),
                }
            }
            SiteKind::ReverseProxy => Upstream::Proxy {
                port: site.port.ok_or(RenderError::MissingField {
                    template: "reverse-proxy vhost",
                    field: "port",
                })?,
            },
        };

        Ok(Self {
            domain: site.primary_domain().to_string(),
            www_redirect: site.www_redirect,
            document_root: site.web_root(),
            upstream,
            tls,
            client_max_body_size: site
                .settings
                .get("client_max_body_size")
                .cloned()
                .unwrap_or_else(|| "64M".to_string()),
        })
    }

    /// Host that serves content.
    fn canonical_host(&self) -> String {
        match self.www_redirect {
            WwwRedirect::ToWww => format!("www.{}", self.domain),
            WwwRedirect::None | WwwRedirect::ToNonWww => self.domain.clone(),
        }
    }

    /// Host that only redirects to the canonical one.
    fn redirect_host(&self) -> Option<String> {
        match self.www_redirect {
            WwwRedirect::None => None,
            WwwRedirect::ToWww => Some(self.domain.clone()),
            WwwRedirect::ToNonWww => Some(format!("www.{}", self.domain)),
        }
    }
}

/// Render the vhost file for a site.
///
/// With TLS, port 80 only answers ACME challenges and redirects to HTTPS.
/// With a www policy, the non-canonical host gets its own redirect block.
pub fn render_vhost(model: &VhostModel) -> Result<String, RenderError> {
    directive_value("domain", &model.domain)?;
    directive_value("document_root", &model.document_root)?;
    directive_value("client_max_body_size", &model.client_max_body_size)?;
    if let Upstream::Php { ref socket } = model.upstream {
        directive_value("fastcgi socket", socket)?;
    }

    let canonical = model.canonical_host();
    let redirect = model.redirect_host();
    let mut out = String::new();

    match model.tls {
        Some(ref tls) => {
            let fullchain = tls.fullchain.to_string_lossy().into_owned();
            let privkey = tls.privkey.to_string_lossy().into_owned();
            directive_value("ssl_certificate", &fullchain)?;
            directive_value("ssl_certificate_key", &privkey)?;

            let mut all_hosts = vec![canonical.clone()];
            all_hosts.extend(redirect.clone());
            out.push_str(&redirect_block(
                "80",
                &all_hosts.join(" "),
                &model.document_root,
                &format!("https://{}", canonical),
                None,
            ));
            if let Some(ref host) = redirect {
                out.push_str(&redirect_block(
                    "443 ssl",
                    host,
                    &model.document_root,
                    &format!("https://{}", canonical),
                    Some((fullchain.as_str(), privkey.as_str())),
                ));
            }
            out.push_str(&main_block(model, &canonical, Some((fullchain.as_str(), privkey.as_str()))));
        }
        None => {
            if let Some(ref host) = redirect {
                out.push_str(&redirect_block(
                    "80",
                    host,
                    &model.document_root,
                    &format!("http://{}", canonical),
                    None,
                ));
            }
            out.push_str(&main_block(model, &canonical, None));
        }
    }

    Ok(out)
}

fn redirect_block(
    listen: &str,
    server_names: &str,
    document_root: &str,
    target: &str,
    tls: Option<(&str, &str)>,
) -> String {
    let mut out = format!(
        "\
server {{
    listen {listen};
    listen [::]:{listen};
    server_name {server_names};
",
        listen = listen,
        server_names = server_names,
    );
    if let Some((cert, key)) = tls {
        out.push_str(&tls_directives(cert, key));
    }
    out.push_str(&format!(
        "
    location /.well-known/acme-challenge/ {{
        root {document_root};
        allow all;
    }}

    location / {{
        return 301 {target}$request_uri;
    }}
}}

",
        document_root = document_root,
        target = target,
    ));
    out
}

fn main_block(model: &VhostModel, server_name: &str, tls: Option<(&str, &str)>) -> String {
    let listen = if tls.is_some() { "443 ssl" } else { "80" };
    let index = match model.upstream {
        Upstream::Php { .. } => "index.php index.html index.htm",
        _ => "index.html index.htm",
    };

    let mut out = format!(
        "\
server {{
    listen {listen};
    listen [::]:{listen};
    server_name {server_name};
    root {root};
    index {index};

    access_log /var/log/nginx/{domain}.access.log;
    error_log /var/log/nginx/{domain}.error.log;

    client_max_body_size {body};
",
        listen = listen,
        server_name = server_name,
        root = model.document_root,
        index = index,
        domain = model.domain,
        body = model.client_max_body_size,
    );

    if let Some((cert, key)) = tls {
        out.push_str(&tls_directives(cert, key));
        out.push_str(
            "    add_header Strict-Transport-Security \"max-age=31536000; includeSubDomains\" always;\n",
        );
    }

    out.push_str(
        "
    add_header X-Frame-Options \"SAMEORIGIN\" always;
    add_header X-Content-Type-Options \"nosniff\" always;
    add_header Referrer-Policy \"strict-origin-when-cross-origin\" always;

    location /.well-known/acme-challenge/ {
        allow all;
    }

    location ~ /\\.(?!well-known) {
        deny all;
    }
",
    );

    match model.upstream {
        Upstream::Static => out.push_str(
            "
    location / {
        try_files $uri $uri/ =404;
    }
",
        ),
        Upstream::Php { ref socket } => out.push_str(&format!(
            "
    location / {{
        try_files $uri $uri/ /index.php?$query_string;
    }}

    location ~ \\.php$ {{
        include fastcgi_params;
        fastcgi_pass unix:{socket};
        fastcgi_index index.php;
        fastcgi_param SCRIPT_FILENAME $realpath_root$fastcgi_script_name;
    }}
",
            socket = socket,
        )),
        Upstream::Proxy { port } => out.push_str(&format!(
            "
    location / {{
        proxy_pass http://127.0.0.1:{port};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection \"upgrade\";
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_cache_bypass $http_upgrade;
    }}
",
            port = port,
        )),
    }

    out.push_str("}\n");
    out
}

fn tls_directives(cert: &str, key: &str) -> String {
    format!(
        "\
    ssl_certificate {cert};
    ssl_certificate_key {key};
    ssl_protocols TLSv1.2 TLSv1.3;
    ssl_prefer_server_ciphers off;
    ssl_session_cache shared:SSL:10m;
",
        cert = cert,
        key = key,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::OsFamily;
    use std::path::PathBuf;

    fn layout() -> HostLayout {
        HostLayout::for_family(OsFamily::Debian)
    }

    fn tls() -> TlsPaths {
        TlsPaths {
            fullchain: PathBuf::from("/etc/letsencrypt/live/example.com/fullchain.pem"),
            privkey: PathBuf::from("/etc/letsencrypt/live/example.com/privkey.pem"),
        }
    }

    #[test]
    fn test_static_site_without_tls() {
        let site = Site::new("example.com", SiteKind::Static);
        let model = VhostModel::for_site(&site, &layout(), None).unwrap();
        let out = render_vhost(&model).unwrap();
        assert!(out.contains("listen 80;"));
        assert!(out.contains("server_name example.com;"));
        assert!(out.contains("root /var/www/example_com;"));
        assert!(out.contains("try_files $uri $uri/ =404;"));
        assert!(!out.contains("ssl_certificate"));
        assert_eq!(out.matches("server {").count(), 1);
    }

    #[test]
    fn test_php_site_uses_pool_socket() {
        let mut site = Site::new("shop.example.com", SiteKind::Php);
        site.php_version = Some("8.2".into());
        let model = VhostModel::for_site(&site, &layout(), None).unwrap();
        let out = render_vhost(&model).unwrap();
        assert!(out.contains("fastcgi_pass unix:/run/php/php8.2-fpm-shop_example_com.sock;"));
        assert!(out.contains("index index.php"));
    }

    #[test]
    fn test_php_site_requires_version() {
        let site = Site::new("example.com", SiteKind::Php);
        assert_eq!(
            VhostModel::for_site(&site, &layout(), None).unwrap_err(),
            RenderError::MissingField {
                template: "php vhost",
                field: "php_version"
            }
        );
    }

    #[test]
    fn test_reverse_proxy_site() {
        let mut site = Site::new("app.example.com", SiteKind::ReverseProxy);
        site.port = Some(3000);
        let model = VhostModel::for_site(&site, &layout(), None).unwrap();
        let out = render_vhost(&model).unwrap();
        assert!(out.contains("proxy_pass http://127.0.0.1:3000;"));
        assert!(out.contains("proxy_set_header Upgrade $http_upgrade;"));
    }

    #[test]
    fn test_tls_redirects_http_to_https() {
        let site = Site::new("example.com", SiteKind::Static);
        let model = VhostModel::for_site(&site, &layout(), Some(tls())).unwrap();
        let out = render_vhost(&model).unwrap();
        assert!(out.contains("return 301 https://example.com$request_uri;"));
        assert!(out.contains("listen 443 ssl;"));
        assert!(out.contains("ssl_certificate /etc/letsencrypt/live/example.com/fullchain.pem;"));
        assert!(out.contains("Strict-Transport-Security"));
    }

    #[test]
    fn test_to_www_redirect_with_tls() {
        let mut site = Site::new("example.com", SiteKind::Static);
        site.www_redirect = WwwRedirect::ToWww;
        let model = VhostModel::for_site(&site, &layout(), Some(tls())).unwrap();
        let out = render_vhost(&model).unwrap();
        assert!(out.contains("server_name www.example.com example.com;"));
        assert!(out.contains("server_name www.example.com;"));
        assert!(out.contains("return 301 https://www.example.com$request_uri;"));
        assert_eq!(out.matches("server {").count(), 3);
    }

    #[test]
    fn test_to_non_www_redirect_without_tls() {
        let mut site = Site::new("example.com", SiteKind::Static);
        site.www_redirect = WwwRedirect::ToNonWww;
        let model = VhostModel::for_site(&site, &layout(), None).unwrap();
        let out = render_vhost(&model).unwrap();
        assert!(out.contains("server_name www.example.com;"));
        assert!(out.contains("return 301 http://example.com$request_uri;"));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let mut site = Site::new("example.com", SiteKind::Php);
        site.php_version = Some("8.3".into());
        site.www_redirect = WwwRedirect::ToWww;
        let model = VhostModel::for_site(&site, &layout(), Some(tls())).unwrap();
        assert_eq!(render_vhost(&model).unwrap(), render_vhost(&model).unwrap());
    }

    #[test]
    fn test_rejects_injected_body_size() {
        let mut site = Site::new("example.com", SiteKind::Static);
        site.settings
            .insert("client_max_body_size".into(), "1M; include /etc/shadow".into());
        let model = VhostModel::for_site(&site, &layout(), None).unwrap();
        assert!(matches!(
            render_vhost(&model),
            Err(RenderError::UnsafeValue { .. })
        ));
    }
}
