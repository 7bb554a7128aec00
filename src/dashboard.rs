//! Web dashboard for the console
//!
//! A small embedded single-page UI: setup wizard, login, an overview, the
//! route list and form, and a settings page. It talks only to the JSON API.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Response, StatusCode};

/// Client-side routes that all serve the same HTML shell
pub fn is_page_route(path: &str) -> bool {
    matches!(path, "/" | "/dashboard" | "/configs" | "/settings" | "/setup" | "/login")
        || path.starts_with("/configs/")
}

/// Serve the main dashboard HTML
pub fn serve_dashboard() -> Response<Full<Bytes>> {
    asset_response("text/html; charset=utf-8", DASHBOARD_HTML)
}

/// Serve dashboard CSS
pub fn serve_css() -> Response<Full<Bytes>> {
    asset_response("text/css; charset=utf-8", DASHBOARD_CSS)
}

/// Serve dashboard JavaScript
pub fn serve_js() -> Response<Full<Bytes>> {
    asset_response("application/javascript; charset=utf-8", DASHBOARD_JS)
}

fn asset_response(content_type: &'static str, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type)
        .header(CACHE_CONTROL, "no-cache")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("valid response")
}

const DASHBOARD_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Caddy UI</title>
    <link rel="stylesheet" href="/assets/style.css">
    <script>
        (function () {
            var theme = localStorage.getItem('caddy-ui-theme');
            if (theme) document.documentElement.dataset.theme = theme;
        })();
    </script>
</head>
<body>
    <nav class="navbar" id="navbar" hidden>
        <div class="nav-brand">
            <a href="/dashboard" data-link><h1>Caddy UI</h1></a>
        </div>
        <div class="nav-links">
            <a href="/dashboard" class="nav-link" data-link data-view="dashboard">Overview</a>
            <a href="/configs" class="nav-link" data-link data-view="configs">Routes</a>
            <a href="/settings" class="nav-link" data-link data-view="settings">Settings</a>
        </div>
        <div class="nav-actions">
            <span id="nav-user" class="nav-user"></span>
            <button class="btn btn-secondary" id="theme-toggle" type="button">Theme</button>
            <button class="btn btn-link" id="logout-button" type="button">Sign out</button>
        </div>
    </nav>

    <main class="container">
        <div id="toast" class="toast" hidden></div>

        <!-- Setup -->
        <section id="setup-view" class="view">
            <div class="card narrow">
                <h2>Welcome</h2>
                <p class="muted">Create the administrator account to finish setting up.</p>
                <form id="setup-form">
                    <label>Name <input name="name" required></label>
                    <label>Email <input name="email" type="email" required></label>
                    <label>Password <input name="password" type="password" minlength="8" required></label>
                    <label>Confirm password <input name="confirm" type="password" minlength="8" required></label>
                    <p class="form-error" data-error></p>
                    <button class="btn btn-primary" type="submit">Complete setup</button>
                </form>
            </div>
        </section>

        <!-- Login -->
        <section id="login-view" class="view">
            <div class="card narrow">
                <h2>Sign in</h2>
                <form id="login-form">
                    <label>Email <input name="email" type="email" required></label>
                    <label>Password <input name="password" type="password" required></label>
                    <p class="form-error" data-error></p>
                    <button class="btn btn-primary" type="submit">Sign in</button>
                </form>
            </div>
        </section>

        <!-- Overview -->
        <section id="dashboard-view" class="view">
            <div class="view-header">
                <h2>Dashboard</h2>
                <div class="actions">
                    <a href="/configs/new" class="btn btn-primary" data-link>New route</a>
                </div>
            </div>
            <div id="overview-stats" class="stats"></div>
            <div class="stats">
                <a href="/configs" class="card stat-link" data-link>
                    <h3>Manage routes</h3>
                    <p class="muted">View and edit reverse-proxy routes</p>
                </a>
                <a href="/configs/new" class="card stat-link" data-link>
                    <h3>Add a route</h3>
                    <p class="muted">Proxy a domain to a new upstream</p>
                </a>
                <a href="/settings" class="card stat-link" data-link>
                    <h3>Settings</h3>
                    <p class="muted">Theme, password and Caddy connection</p>
                </a>
            </div>
        </section>

        <!-- Route list -->
        <section id="configs-view" class="view">
            <div class="view-header">
                <h2>Proxy routes</h2>
                <div class="actions">
                    <button class="btn btn-secondary" id="reconcile-button" type="button" hidden>Sync all</button>
                    <a href="/configs/new" class="btn btn-primary" data-link>New route</a>
                </div>
            </div>
            <div id="sync-summary" class="sync-summary"></div>
            <div id="configs-list"></div>
        </section>

        <!-- Route form -->
        <section id="config-form-view" class="view">
            <div class="view-header">
                <a href="/configs" class="btn btn-link" data-link>&larr; Back to routes</a>
                <h2 id="config-form-title">New route</h2>
            </div>
            <div class="card">
                <form id="config-form">
                    <label>Name <input name="name" required placeholder="My website"></label>
                    <label>Domain <input name="domain" required placeholder="example.com"></label>
                    <label>Target URL <input name="targetUrl" required placeholder="http://localhost:3000"></label>
                    <label>Path <input name="path" placeholder="/api (optional)"></label>
                    <label class="checkbox"><input name="enabled" type="checkbox" checked> Enabled</label>
                    <p class="form-error" data-error></p>
                    <button class="btn btn-primary" type="submit">Save</button>
                </form>
            </div>
        </section>

        <!-- Settings -->
        <section id="settings-view" class="view">
            <div class="view-header">
                <h2>Settings</h2>
            </div>
            <div class="card">
                <h3>Appearance</h3>
                <label>Theme
                    <select id="theme-select">
                        <option value="">System</option>
                        <option value="light">Light</option>
                        <option value="dark">Dark</option>
                    </select>
                </label>
            </div>
            <div class="card">
                <h3>Change password</h3>
                <form id="password-form">
                    <label>Current password <input name="currentPassword" type="password" required></label>
                    <label>New password <input name="newPassword" type="password" minlength="8" required></label>
                    <label>Confirm new password <input name="confirm" type="password" minlength="8" required></label>
                    <p class="form-error" data-error></p>
                    <button class="btn btn-primary" type="submit">Update password</button>
                </form>
            </div>
            <div class="card" id="caddy-card">
                <h3>Caddy</h3>
                <dl id="caddy-status" class="details"></dl>
            </div>
        </section>
    </main>

    <script src="/assets/app.js"></script>
</body>
</html>
"##;

const DASHBOARD_CSS: &str = r##"
:root {
    --primary: #22b638;
    --primary-dark: #1a8f2c;
    --success: #10b981;
    --warning: #f59e0b;
    --danger: #ef4444;
    --bg: #f3f4f6;
    --surface: #ffffff;
    --border: #e5e7eb;
    --text: #1f2937;
    --muted: #6b7280;
    --nav: #111827;
}

[data-theme="dark"] {
    --bg: #0f172a;
    --surface: #1e293b;
    --border: #334155;
    --text: #e2e8f0;
    --muted: #94a3b8;
    --nav: #020617;
}

@media (prefers-color-scheme: dark) {
    :root:not([data-theme="light"]) {
        --bg: #0f172a;
        --surface: #1e293b;
        --border: #334155;
        --text: #e2e8f0;
        --muted: #94a3b8;
        --nav: #020617;
    }
}

* {
    box-sizing: border-box;
    margin: 0;
    padding: 0;
}

body {
    font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
    background: var(--bg);
    color: var(--text);
    line-height: 1.5;
}

a {
    color: inherit;
}

/* Navbar */
.navbar {
    background: var(--nav);
    color: white;
    padding: 0 1.5rem;
    height: 60px;
    display: flex;
    align-items: center;
    justify-content: space-between;
    position: sticky;
    top: 0;
    z-index: 100;
}

.navbar[hidden] {
    display: none;
}

.nav-brand a {
    text-decoration: none;
}

.nav-brand h1 {
    font-size: 1.25rem;
    font-weight: 600;
}

.nav-links,
.nav-actions,
.actions {
    display: flex;
    gap: 0.5rem;
    align-items: center;
}

.nav-link {
    color: #d1d5db;
    text-decoration: none;
    padding: 0.5rem 1rem;
    border-radius: 0.375rem;
}

.nav-link:hover,
.nav-link.active {
    color: white;
    background: var(--primary);
}

.nav-user {
    color: #9ca3af;
    font-size: 0.875rem;
}

.container {
    max-width: 1100px;
    margin: 0 auto;
    padding: 1.5rem;
}

.view {
    display: none;
}

.view.active {
    display: block;
}

.view-header {
    display: flex;
    justify-content: space-between;
    align-items: center;
    margin-bottom: 1rem;
    gap: 1rem;
}

.card {
    background: var(--surface);
    border: 1px solid var(--border);
    border-radius: 0.5rem;
    padding: 1.5rem;
    margin-bottom: 1rem;
}

.card.narrow {
    max-width: 420px;
    margin: 3rem auto;
}

.card h3 {
    margin-bottom: 0.75rem;
}

.muted {
    color: var(--muted);
}

/* Forms */
form label {
    display: block;
    margin-bottom: 0.75rem;
    font-size: 0.875rem;
    color: var(--muted);
}

form input,
select {
    display: block;
    width: 100%;
    margin-top: 0.25rem;
    padding: 0.5rem 0.75rem;
    border: 1px solid var(--border);
    border-radius: 0.375rem;
    background: var(--bg);
    color: var(--text);
    font-size: 1rem;
}

form label.checkbox {
    display: flex;
    gap: 0.5rem;
    align-items: center;
}

form label.checkbox input {
    display: inline;
    width: auto;
    margin: 0;
}

.form-error {
    color: var(--danger);
    min-height: 1.25rem;
    margin-bottom: 0.5rem;
    font-size: 0.875rem;
}

/* Buttons */
.btn {
    display: inline-block;
    padding: 0.5rem 1rem;
    border: none;
    border-radius: 0.375rem;
    font-size: 0.875rem;
    font-weight: 500;
    cursor: pointer;
    text-decoration: none;
}

.btn-primary {
    background: var(--primary);
    color: white;
}

.btn-primary:hover {
    background: var(--primary-dark);
}

.btn-secondary {
    background: var(--border);
    color: var(--text);
}

.btn-danger {
    background: var(--danger);
    color: white;
}

.btn-link {
    background: none;
    color: inherit;
}

.btn-small {
    padding: 0.25rem 0.5rem;
    font-size: 0.75rem;
}

/* Route table */
table {
    width: 100%;
    border-collapse: collapse;
    background: var(--surface);
    border: 1px solid var(--border);
    border-radius: 0.5rem;
    overflow: hidden;
}

th,
td {
    text-align: left;
    padding: 0.75rem 1rem;
    border-bottom: 1px solid var(--border);
    font-size: 0.875rem;
}

th {
    color: var(--muted);
    font-weight: 500;
}

td.row-actions {
    white-space: nowrap;
    text-align: right;
}

.badge {
    display: inline-block;
    padding: 0.125rem 0.5rem;
    border-radius: 9999px;
    font-size: 0.75rem;
    font-weight: 500;
}

.badge-synced { background: #d1fae5; color: #065f46; }
.badge-pending { background: #fef3c7; color: #92400e; }
.badge-failed { background: #fee2e2; color: #991b1b; }
.badge-disabled { background: var(--border); color: var(--muted); }

.stats {
    display: grid;
    grid-template-columns: repeat(auto-fit, minmax(12rem, 1fr));
    gap: 1rem;
    margin-bottom: 1.5rem;
}

.stat-value {
    font-size: 2rem;
    font-weight: 700;
}

.stat-link {
    color: inherit;
    text-decoration: none;
}

.sync-summary {
    color: var(--muted);
    font-size: 0.875rem;
    margin-bottom: 0.75rem;
}

.empty-state {
    text-align: center;
    padding: 3rem;
    color: var(--muted);
}

.details {
    display: grid;
    grid-template-columns: max-content 1fr;
    gap: 0.25rem 1rem;
    font-size: 0.875rem;
}

.details dt {
    color: var(--muted);
}

.toast {
    position: fixed;
    bottom: 1.5rem;
    right: 1.5rem;
    background: var(--nav);
    color: white;
    padding: 0.75rem 1rem;
    border-radius: 0.375rem;
    max-width: 420px;
}

.toast.error {
    background: var(--danger);
}
"##;

const DASHBOARD_JS: &str = r##"
const THEME_KEY = 'caddy-ui-theme';
let session = null;

document.addEventListener('DOMContentLoaded', () => {
    document.body.addEventListener('click', (e) => {
        const link = e.target.closest('a[data-link]');
        if (link) {
            e.preventDefault();
            navigate(link.getAttribute('href'));
        }
    });
    window.addEventListener('popstate', () => route());

    document.getElementById('setup-form').addEventListener('submit', submitSetup);
    document.getElementById('login-form').addEventListener('submit', submitLogin);
    document.getElementById('config-form').addEventListener('submit', submitConfig);
    document.getElementById('password-form').addEventListener('submit', submitPassword);
    document.getElementById('logout-button').addEventListener('click', logout);
    document.getElementById('reconcile-button').addEventListener('click', reconcileAll);
    document.getElementById('theme-toggle').addEventListener('click', toggleTheme);
    document.getElementById('theme-select').addEventListener('change', (e) => setTheme(e.target.value));

    route();
});

// ==================== API ====================

async function api(method, path, body) {
    const options = { method, headers: {}, credentials: 'same-origin' };
    if (body !== undefined) {
        options.headers['Content-Type'] = 'application/json';
        options.body = JSON.stringify(body);
    }

    const response = await fetch(path, options);
    const text = await response.text();
    const data = text ? JSON.parse(text) : null;

    if (!response.ok) {
        const error = new Error((data && data.error) || `Request failed (${response.status})`);
        error.status = response.status;
        error.code = data && data.code;
        error.data = data;
        throw error;
    }
    return data;
}

// ==================== Routing ====================

function navigate(path) {
    if (location.pathname !== path) {
        history.pushState(null, '', path);
    }
    route();
}

async function route() {
    const path = location.pathname;

    const setup = await api('GET', '/api/setup/status').catch(() => ({ setupRequired: false }));
    if (setup.setupRequired) {
        if (path !== '/setup') history.replaceState(null, '', '/setup');
        return showView('setup');
    }

    session = await api('GET', '/api/auth/session').catch(() => null);
    if (!session) {
        if (path !== '/login') history.replaceState(null, '', '/login');
        return showView('login');
    }

    renderNav();

    if (path === '/settings') {
        showView('settings');
        return loadSettings();
    }
    if (path === '/configs') {
        showView('configs');
        return loadConfigs();
    }
    if (path === '/configs/new') {
        showView('config-form');
        return fillConfigForm(null);
    }
    const edit = path.match(/^\/configs\/([^/]+)\/edit$/);
    if (edit) {
        showView('config-form');
        return loadConfigForEdit(decodeURIComponent(edit[1]));
    }

    if (path !== '/dashboard') history.replaceState(null, '', '/dashboard');
    showView('dashboard');
    return loadOverview();
}

function showView(name) {
    document.querySelectorAll('.view').forEach(v => v.classList.remove('active'));
    document.getElementById(`${name}-view`).classList.add('active');
    document.getElementById('navbar').hidden = !session || name === 'setup' || name === 'login';
    document.querySelectorAll('.nav-link').forEach(l => {
        l.classList.toggle('active', name.startsWith(l.dataset.view));
    });
}

function renderNav() {
    document.getElementById('nav-user').textContent = session.name || session.email;
    document.getElementById('reconcile-button').hidden = !session.isAdmin;
}

// ==================== Setup & Auth ====================

async function submitSetup(e) {
    e.preventDefault();
    const form = e.target;
    const values = formValues(form);
    if (values.password !== values.confirm) {
        return showFormError(form, 'Passwords do not match');
    }

    try {
        await api('POST', '/api/setup/complete', {
            name: values.name,
            email: values.email,
            password: values.password,
        });
        await api('POST', '/api/auth/login', { email: values.email, password: values.password });
        form.reset();
        navigate('/dashboard');
    } catch (err) {
        showFormError(form, err.message);
    }
}

async function submitLogin(e) {
    e.preventDefault();
    const form = e.target;
    const values = formValues(form);

    try {
        session = await api('POST', '/api/auth/login', values);
        form.reset();
        navigate('/dashboard');
    } catch (err) {
        showFormError(form, err.message);
    }
}

async function logout() {
    await api('POST', '/api/auth/logout').catch(() => null);
    session = null;
    navigate('/login');
}

// ==================== Overview ====================

async function loadOverview() {
    const container = document.getElementById('overview-stats');
    container.innerHTML = '<div class="empty-state">Loading...</div>';

    try {
        const status = await api('GET', '/api/caddy/status');
        const c = status.configs;
        const caddy = status.syncEnabled ? escapeHtml(status.adminUrl) : 'Sync disabled';
        container.innerHTML = `
            <div class="card"><h3>Active routes</h3><div class="stat-value">${c.enabled}</div><p class="muted">${c.total} total</p></div>
            <div class="card"><h3>Synced</h3><div class="stat-value">${c.synced}</div><p class="muted">${c.pending} pending</p></div>
            <div class="card"><h3>Failed</h3><div class="stat-value">${c.failed}</div><p class="muted">${caddy}</p></div>
        `;
    } catch (err) {
        container.innerHTML = `<div class="empty-state">${escapeHtml(err.message)}</div>`;
    }
}

// ==================== Routes ====================

async function loadConfigs() {
    const container = document.getElementById('configs-list');
    container.innerHTML = '<div class="empty-state">Loading...</div>';

    try {
        const [configs, status] = await Promise.all([
            api('GET', '/api/configs'),
            api('GET', '/api/caddy/status'),
        ]);
        renderSyncSummary(status);

        if (configs.length === 0) {
            container.innerHTML = `
                <div class="empty-state">
                    <p>No routes yet</p>
                    <a href="/configs/new" class="btn btn-primary" data-link>Create your first route</a>
                </div>
            `;
            return;
        }

        container.innerHTML = `
            <table>
                <thead>
                    <tr><th>Name</th><th>Domain</th><th>Target</th><th>Status</th><th>Owner</th><th></th></tr>
                </thead>
                <tbody>
                    ${configs.map(renderConfigRow).join('')}
                </tbody>
            </table>
        `;

        container.querySelectorAll('[data-action]').forEach(btn => {
            btn.addEventListener('click', () => configAction(btn.dataset.action, btn.dataset.id, configs));
        });
    } catch (err) {
        container.innerHTML = `<div class="empty-state">${escapeHtml(err.message)}</div>`;
    }
}

function renderConfigRow(config) {
    const canModify = session.isAdmin || config.creatorId === session.id;
    const id = escapeHtml(config.id);
    const status = config.enabled ? config.syncStatus : 'disabled';
    const title = config.syncError ? ` title="${escapeHtml(config.syncError)}"` : '';

    return `
        <tr>
            <td>${escapeHtml(config.name)}</td>
            <td>${escapeHtml(config.domain)}${config.path ? `<span class="muted">${escapeHtml(config.path)}</span>` : ''}</td>
            <td>${escapeHtml(config.targetUrl)}</td>
            <td><span class="badge badge-${escapeHtml(status)}"${title}>${escapeHtml(status)}</span></td>
            <td class="muted">${escapeHtml(config.creator.name || config.creator.email)}</td>
            <td class="row-actions">
                ${canModify ? `
                    <button class="btn btn-secondary btn-small" data-action="toggle" data-id="${id}">${config.enabled ? 'Disable' : 'Enable'}</button>
                    ${config.syncStatus === 'failed' ? `<button class="btn btn-secondary btn-small" data-action="sync" data-id="${id}">Retry</button>` : ''}
                    <a class="btn btn-secondary btn-small" href="/configs/${encodeURIComponent(config.id)}/edit" data-link>Edit</a>
                    <button class="btn btn-danger btn-small" data-action="delete" data-id="${id}">Delete</button>
                ` : ''}
            </td>
        </tr>
    `;
}

function renderSyncSummary(status) {
    const el = document.getElementById('sync-summary');
    if (!status.syncEnabled) {
        el.textContent = 'Caddy sync is disabled; routes are stored only.';
        return;
    }
    const c = status.configs;
    el.textContent = `${c.total} routes · ${c.synced} synced · ${c.pending} pending · ${c.failed} failed`;
}

async function configAction(action, id, configs) {
    const config = configs.find(c => c.id === id);
    const path = `/api/configs/${encodeURIComponent(id)}`;

    try {
        if (action === 'delete') {
            if (!confirm(`Delete route "${config.name}"?`)) return;
            await api('DELETE', path);
            toast('Route deleted');
        } else if (action === 'toggle') {
            await api('PUT', path, {
                name: config.name,
                domain: config.domain,
                targetUrl: config.targetUrl,
                path: config.path || '',
                enabled: !config.enabled,
            });
            toast(config.enabled ? 'Route disabled' : 'Route enabled');
        } else if (action === 'sync') {
            await api('POST', `${path}/sync`);
            toast('Route synced');
        }
    } catch (err) {
        toast(err.message, true);
    }
    loadConfigs();
}

async function reconcileAll() {
    try {
        const report = await api('POST', '/api/caddy/reconcile');
        toast(report.applied ? `Caddy updated: ${report.managedRoutes} routes` : 'Caddy already up to date');
    } catch (err) {
        toast(err.message, true);
    }
    loadConfigs();
}

let editingId = null;

function fillConfigForm(config) {
    const form = document.getElementById('config-form');
    editingId = config ? config.id : null;
    document.getElementById('config-form-title').textContent = config ? `Edit ${config.name}` : 'New route';
    form.reset();
    showFormError(form, '');
    if (config) {
        form.elements.name.value = config.name;
        form.elements.domain.value = config.domain;
        form.elements.targetUrl.value = config.targetUrl;
        form.elements.path.value = config.path || '';
        form.elements.enabled.checked = config.enabled;
    }
}

async function loadConfigForEdit(id) {
    try {
        fillConfigForm(await api('GET', `/api/configs/${encodeURIComponent(id)}`));
    } catch (err) {
        toast(err.message, true);
        navigate('/configs');
    }
}

async function submitConfig(e) {
    e.preventDefault();
    const form = e.target;
    const body = {
        name: form.elements.name.value.trim(),
        domain: form.elements.domain.value.trim(),
        targetUrl: form.elements.targetUrl.value.trim(),
        path: form.elements.path.value.trim(),
        enabled: form.elements.enabled.checked,
    };

    try {
        if (editingId) {
            await api('PUT', `/api/configs/${encodeURIComponent(editingId)}`, body);
        } else {
            await api('POST', '/api/configs', body);
        }
        toast('Route saved');
        navigate('/configs');
    } catch (err) {
        if (err.code === 'CADDY_SYNC_FAILED') {
            toast(`Saved, but Caddy was not updated: ${err.message}`, true);
            return navigate('/configs');
        }
        showFormError(form, err.message);
    }
}

// ==================== Settings ====================

async function loadSettings() {
    document.getElementById('theme-select').value = localStorage.getItem(THEME_KEY) || '';

    const dl = document.getElementById('caddy-status');
    try {
        const status = await api('GET', '/api/caddy/status');
        dl.innerHTML = `
            <dt>Admin API</dt><dd>${escapeHtml(status.adminUrl)}</dd>
            <dt>Server</dt><dd>${escapeHtml(status.server)}</dd>
            <dt>Sync</dt><dd>${status.syncEnabled ? 'enabled' : 'disabled'}</dd>
        `;
    } catch (err) {
        dl.innerHTML = `<dt>Error</dt><dd>${escapeHtml(err.message)}</dd>`;
    }
}

async function submitPassword(e) {
    e.preventDefault();
    const form = e.target;
    const values = formValues(form);
    if (values.newPassword !== values.confirm) {
        return showFormError(form, 'Passwords do not match');
    }

    try {
        await api('POST', '/api/user/change-password', {
            currentPassword: values.currentPassword,
            newPassword: values.newPassword,
        });
        form.reset();
        showFormError(form, '');
        toast('Password updated');
    } catch (err) {
        showFormError(form, err.message);
    }
}

function setTheme(theme) {
    if (theme) {
        localStorage.setItem(THEME_KEY, theme);
        document.documentElement.dataset.theme = theme;
    } else {
        localStorage.removeItem(THEME_KEY);
        delete document.documentElement.dataset.theme;
    }
}

function toggleTheme() {
    const current = document.documentElement.dataset.theme
        || (matchMedia('(prefers-color-scheme: dark)').matches ? 'dark' : 'light');
    setTheme(current === 'dark' ? 'light' : 'dark');
    document.getElementById('theme-select').value = localStorage.getItem(THEME_KEY) || '';
}

// ==================== Helpers ====================

function formValues(form) {
    return Object.fromEntries(new FormData(form).entries());
}

function showFormError(form, message) {
    form.querySelector('[data-error]').textContent = message;
}

let toastTimer = null;

function toast(message, isError = false) {
    const el = document.getElementById('toast');
    el.textContent = message;
    el.classList.toggle('error', isError);
    el.hidden = false;
    clearTimeout(toastTimer);
    toastTimer = setTimeout(() => { el.hidden = true; }, 4000);
}

function escapeHtml(value) {
    return String(value ?? '')
        .replace(/&/g, '&amp;')
        .replace(/</g, '&lt;')
        .replace(/>/g, '&gt;')
        .replace(/"/g, '&quot;')
        .replace(/'/g, '&#39;');
}
"##;
